pub mod constants;
pub mod controller;
pub mod frame_parser;
pub mod hardening;
pub mod history;
pub mod logging;
pub mod main_helper;
pub mod metrics;
pub mod render_sync;
pub mod streaming;
pub mod token_counting;
pub mod transport;
pub mod types;
pub mod worker;

pub use types::*;

pub use controller::{
    ChatController, ChatSettings, ControllerConfig, ControllerStatus, RequestHandle,
    RequestOutcome, RequestState,
};
pub use history::{History, HistoryStore};
pub use main_helper::Args;
pub use transport::{BufferedReply, ChatRequestBody, ChatTransport, HttpTransport};
