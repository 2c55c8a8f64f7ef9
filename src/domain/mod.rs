pub mod chain;
pub mod instrument;
pub mod pending_switch;
pub mod session_config;
pub mod status;
pub mod tick;
pub mod window;

pub use chain::{OptionChain, StrikeRow};
pub use instrument::InstrumentKey;
pub use pending_switch::{PendingSwitch, PendingSwitchOutcome};
pub use session_config::SessionConfig;
pub use status::{FeedStatus, FeedTransitionEvent};
pub use tick::{Tick, TickDelta};
pub use window::LiveWindow;
