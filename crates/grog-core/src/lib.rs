pub mod errors;
pub mod ids;
pub mod record;

pub use errors::CoreError;
pub use ids::{Sequence, SessionId, KEY_WIDTH};
pub use record::{encode_window, LogRecord, RecordKind};
