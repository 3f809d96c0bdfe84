//! Market data feed: binary packet codec, websocket client and simulator.

pub mod capture;
pub mod client;
pub mod decoder;
pub mod encoder;
pub mod simulator;
pub mod subscription;

pub use capture::{read_frame, write_frame};
pub use client::FeedClient;
pub use decoder::{adjust_epoch, decode, decode_partial, DecodeError, DecodeOutcome};
pub use encoder::{encode_frame, encode_tick};
pub use simulator::{FeedSimulator, SimulatorConfig};
pub use subscription::{subscribe_message, SubscriptionPreference};
