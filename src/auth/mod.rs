// Session module
// Token store, durable storage and single-flight refresh

mod coordinator;
mod refresh;
mod storage;
mod store;
mod types;

pub use coordinator::{RefreshCoordinator, RefreshOutcome};
pub use refresh::{HttpRefresher, Refresher};
pub use storage::{MemoryTokenStorage, SqliteTokenStorage, TokenStorage};
pub use store::TokenStore;
pub use types::{AccessToken, PersistedSession, RefreshToken, TokenPair};
