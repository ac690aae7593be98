pub mod backends;
pub mod caller;
pub mod config;
pub mod context;
pub mod db;
pub mod dispatch;
pub mod duplicate;
pub mod flags;
pub mod github;
pub mod notify;
pub mod orchestrator;
pub mod poster;
pub mod testing;
pub mod validation;

pub use backends::ModelBackend;
pub use dispatch::{BackendPool, DispatchError, Dispatcher, ModelResult};
pub use flags::{FeatureFlag, FeatureFlags, StaticFlags};
pub use github::{GithubClient, VcsHost};
pub use notify::{Notifier, NullNotifier, SlackNotifier};
pub use orchestrator::{ReviewFailure, ReviewOptions, ReviewOrchestrator, ReviewOutcome};
pub use poster::{ApprovalOutcome, PostOutcome, Poster};

pub fn get_bot_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}
