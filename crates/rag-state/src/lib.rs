pub mod action_parser;
pub mod handlers;
pub mod items;
pub mod ledger;

pub use action_parser::{ActionKind, ActionParser, ParsedAction};
pub use handlers::{handle_state_query, handle_state_set};
pub use items::{ItemTracker, NormalizedItem};
pub use ledger::{StateLedger, WriteContext};
