use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
};

use parking_lot::Mutex;

use crate::{
    api::{Comment, CommentId, Error, Gateway, Page, PageRequest, PostId},
    ClientConfig, CommentCache, Disclosure, NodeState, ScopeKey,
};

/// The comment section of one post: the cache slices it reads from, and the
/// disclosure state of every node currently mounted
pub struct CommentThread {
    pub(crate) post: PostId,
    pub(crate) gateway: Arc<dyn Gateway>,
    pub(crate) cache: Arc<CommentCache>,
    pub(crate) config: ClientConfig,
    pub(crate) nodes: Mutex<HashMap<ScopeKey, NodeState>>,
    epochs: AtomicU64,
}

impl CommentThread {
    pub fn new(
        post: PostId,
        gateway: Arc<dyn Gateway>,
        cache: Arc<CommentCache>,
        config: ClientConfig,
    ) -> CommentThread {
        CommentThread {
            post,
            gateway,
            cache,
            config,
            nodes: Mutex::new(HashMap::new()),
            epochs: AtomicU64::new(0),
        }
    }

    pub fn post(&self) -> PostId {
        self.post
    }

    pub fn cache(&self) -> &Arc<CommentCache> {
        &self.cache
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn root_key(&self) -> ScopeKey {
        ScopeKey::TopLevel(self.post)
    }

    pub fn node_key(&self, comment: CommentId) -> ScopeKey {
        ScopeKey::Replies(self.post, comment)
    }

    pub fn node(&self, key: &ScopeKey) -> Option<NodeState> {
        self.nodes.lock().get(key).cloned()
    }

    /// Disclosure of a node, `Collapsed` for nodes never touched
    pub fn disclosure(&self, key: &ScopeKey) -> Disclosure {
        self.nodes
            .lock()
            .get(key)
            .map(|n| n.disclosure.clone())
            .unwrap_or(Disclosure::Collapsed)
    }

    pub fn comment(&self, id: CommentId) -> Option<Comment> {
        self.cache.comment(id)
    }

    /// Loaded children of a node, in server order
    pub fn children(&self, key: &ScopeKey) -> Vec<Comment> {
        match self.disclosure(key) {
            Disclosure::Expanded(ids) => {
                let loaded = self.cache.scope_comments(key);
                ids.iter()
                    .filter_map(|id| loaded.iter().find(|c| c.id == *id).cloned())
                    .collect()
            }
            _ => Vec::new(),
        }
    }

    pub(crate) fn nodes_snapshot(&self) -> HashMap<ScopeKey, NodeState> {
        self.nodes.lock().clone()
    }

    pub(crate) fn new_node(&self) -> NodeState {
        NodeState::new(self.epochs.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn page(&self, page: u32) -> PageRequest {
        PageRequest::nth(page, self.config.page_size)
    }

    pub(crate) async fn fetch(
        &self,
        key: ScopeKey,
        page: PageRequest,
    ) -> Result<Page<Comment>, Error> {
        tracing::debug!(scope = %key, page = page.page, "fetching comments");
        match key {
            ScopeKey::TopLevel(post) => self.gateway.fetch_top_level(post, page).await,
            ScopeKey::Replies(post, comment) => {
                self.gateway.fetch_replies(post, comment, page).await
            }
        }
    }
}
