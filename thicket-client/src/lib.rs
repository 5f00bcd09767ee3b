mod cache;
pub use cache::{CacheEntry, CommentCache, FetchOutcome, FetchTicket, Invalidation, ScopeKey};

mod config;
pub use config::{ClientConfig, CollapsePolicy, DEFAULT_BASE_URL, DEFAULT_MAX_DEPTH};

mod disclosure;
pub use disclosure::{Disclosure, NodeState, PendingAction, Transition};

mod gateway;
pub use gateway::HttpGateway;

mod mutation;

mod render;
pub use render::{render, Connectors, NodeBody, RenderedNode, RenderedThread};

mod session;
pub use session::{FileTokenStore, MemoryTokenStore, Session, TokenStore};

mod thread;
pub use thread::CommentThread;

pub mod api {
    pub use thicket_api::*;
}
