//! Segment-based media playback engine.
//!
//! An [`Asset`] is an ordered list of URL and padding segments. A [`PlayerItem`]
//! resolves it into a [`Timeline`] and plays it through demux, decode and process
//! stages connected by capacity-gated queues, pacing the output through a [`Clock`].

pub mod cancel;
pub mod capacity;
pub mod clock;
pub mod config;
pub mod decode;
pub mod decoder;
mod demux;
pub mod error;
pub mod events;
pub mod frame;
mod item;
mod pipeline;
pub mod process;
pub mod queue;
pub mod reader;
pub mod render;
pub mod source;
pub mod time;
pub mod timeline;
pub mod track;

pub use media_player_types::{
    BufferingState, PlaybackEndReason, PlaybackState, PlayerStatus, TrackKind,
};

pub use clock::{Clock, ManualTimeSource, ScaledTimeSource, SystemTimeSource, TimeSource};
pub use config::PlayerOptions;
pub use error::{ErrorContext, PlayerError, Result};
pub use events::{EventBus, PlayerEvent};
pub use item::{PlayerItem, PlayerItemBuilder, SeekHandle};
pub use reader::FrameReader;
pub use time::MediaTime;
pub use timeline::{Asset, AssetBuilder, MutableAsset, ResolvedSegment, Segment, Timeline};
pub use track::{Track, TrackId, TrackSelection};
