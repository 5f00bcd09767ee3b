use std::{collections::HashMap, ops::RangeInclusive};

use futures::future::join_all;

use crate::{
    api::{CommentId, Error},
    CollapsePolicy, CommentThread, FetchOutcome, ScopeKey,
};

/// Whether the replies of a node are hidden, loading or shown
#[derive(Clone, Debug, PartialEq)]
pub enum Disclosure {
    Collapsed,
    Loading,
    ExpandedEmpty,

    /// Ids of the loaded children, in server order; the records stay in
    /// the cache
    Expanded(Vec<CommentId>),

    Error(Error),
}

#[derive(Clone, Debug, PartialEq)]
pub enum Transition {
    /// User asked to see the replies (or to retry after an error)
    Expand,
    Fetched(Vec<CommentId>),
    Failed(Error),
    Invalidated,
}

impl Disclosure {
    /// Next state, or `None` if the transition does not apply
    pub fn on(&self, t: Transition) -> Option<Disclosure> {
        match (self, t) {
            (Disclosure::Collapsed | Disclosure::Error(_), Transition::Expand) => {
                Some(Disclosure::Loading)
            }
            (
                Disclosure::Loading | Disclosure::Expanded(_) | Disclosure::ExpandedEmpty,
                Transition::Fetched(ids),
            ) => Some(match ids.is_empty() {
                true => Disclosure::ExpandedEmpty,
                false => Disclosure::Expanded(ids),
            }),
            // the scope is gone: shown as empty, not as an error
            (Disclosure::Loading, Transition::Failed(Error::NotFound)) => {
                Some(Disclosure::ExpandedEmpty)
            }
            (Disclosure::Loading, Transition::Failed(e)) => Some(Disclosure::Error(e)),
            (Disclosure::Expanded(_) | Disclosure::ExpandedEmpty, Transition::Invalidated) => {
                Some(Disclosure::Loading)
            }
            _ => None,
        }
    }

    pub fn is_disclosed(&self) -> bool {
        matches!(self, Disclosure::Expanded(_) | Disclosure::ExpandedEmpty)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PendingAction {
    Reply,
    Edit,
    Delete,
    Like,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Round {
    seq: u64,
    epoch: u64,
}

/// Client-only state of one mounted node
#[derive(Clone, Debug, PartialEq)]
pub struct NodeState {
    pub disclosure: Disclosure,

    /// Collapsing only hides the children, it does not drop them
    pub shown: bool,

    /// The server reported the scope as gone
    pub removed: bool,

    pub loading_more: bool,
    pub more_error: Option<Error>,

    pub composer_open: bool,
    pub pending: Option<PendingAction>,

    /// Failure of the last mutation issued from this node
    pub mutation_error: Option<Error>,

    round: u64,
    epoch: u64,
}

impl NodeState {
    pub(crate) fn new(epoch: u64) -> NodeState {
        NodeState {
            disclosure: Disclosure::Collapsed,
            shown: false,
            removed: false,
            loading_more: false,
            more_error: None,
            composer_open: false,
            pending: None,
            mutation_error: None,
            round: 0,
            epoch,
        }
    }

    /// Holds nothing a fresh node would not, so it can be dropped
    pub(crate) fn is_idle(&self) -> bool {
        self.disclosure == Disclosure::Collapsed
            && !self.shown
            && !self.removed
            && !self.loading_more
            && self.more_error.is_none()
            && !self.composer_open
            && self.pending.is_none()
            && self.mutation_error.is_none()
    }

    fn start_round(&mut self) -> Round {
        self.round += 1;
        Round {
            seq: self.round,
            epoch: self.epoch,
        }
    }

    fn owns(&self, r: Round) -> bool {
        self.round == r.seq && self.epoch == r.epoch
    }
}

/// Removes the node and everything mounted below it, returning the keys
pub(crate) fn unmount_locked(
    nodes: &mut HashMap<ScopeKey, NodeState>,
    key: ScopeKey,
) -> Vec<ScopeKey> {
    let mut removed = Vec::new();
    let mut todo = vec![key];
    while let Some(k) = todo.pop() {
        if let Some(node) = nodes.remove(&k) {
            if let Disclosure::Expanded(ids) = node.disclosure {
                todo.extend(ids.into_iter().map(|id| ScopeKey::Replies(k.post(), id)));
            }
            removed.push(k);
        }
    }
    removed
}

impl CommentThread {
    /// Loads the first page of top-level comments
    pub async fn open(&self) -> Result<(), Error> {
        self.disclose(self.root_key()).await
    }

    pub async fn expand(&self, comment: CommentId) -> Result<(), Error> {
        self.disclose(self.node_key(comment)).await
    }

    /// Shows the node's children, fetching them only on first disclosure
    ///
    /// Fetch failures land in the node's state; only `Error::Auth` is
    /// returned, for the session handler.
    pub async fn disclose(&self, key: ScopeKey) -> Result<(), Error> {
        let round = {
            let mut nodes = self.nodes.lock();
            let node = nodes.entry(key).or_insert_with(|| self.new_node());
            node.shown = true;
            let Some(next) = node.disclosure.on(Transition::Expand) else {
                // already loading or loaded
                return Ok(());
            };
            let fresh = self
                .cache
                .get(&key, self.page(1))
                .map_or(false, |e| e.is_fresh());
            if matches!(node.disclosure, Disclosure::Collapsed) && fresh {
                tracing::debug!(scope = %key, "disclosing from cache");
                let ids = self.cache.scope_ids(&key);
                node.disclosure = next.on(Transition::Fetched(ids)).unwrap_or(next);
                return Ok(());
            }
            node.disclosure = next;
            node.removed = false;
            node.start_round()
        };
        self.run_round(key, round, 1..=1).await
    }

    pub async fn retry(&self, key: ScopeKey) -> Result<(), Error> {
        match self.disclosure(&key) {
            Disclosure::Error(_) => self.disclose(key).await,
            _ => Ok(()),
        }
    }

    /// Hides the node's children, or forgets them under `CollapsePolicy::Discard`
    pub fn collapse(&self, key: ScopeKey) {
        let mut nodes = self.nodes.lock();
        match self.config.collapse {
            CollapsePolicy::Retain => {
                if let Some(node) = nodes.get_mut(&key) {
                    node.shown = false;
                }
            }
            CollapsePolicy::Discard => {
                for k in unmount_locked(&mut nodes, key) {
                    self.cache.evict(&k);
                }
            }
        }
    }

    /// Refetches every loaded or loading page of a disclosed node, keeping
    /// it mounted
    ///
    /// Collapsed and failed nodes stay lazy: they fetch on next disclosure.
    pub async fn refresh(&self, key: ScopeKey) -> Result<(), Error> {
        let (round, pages) = {
            let mut nodes = self.nodes.lock();
            let Some(node) = nodes.get_mut(&key) else {
                return Ok(());
            };
            match node.disclosure.on(Transition::Invalidated) {
                Some(next) => node.disclosure = next,
                None if node.disclosure == Disclosure::Loading => (),
                None => return Ok(()),
            }
            node.loading_more = false;
            // include a page whose load_more is still in flight, its result
            // would otherwise land in the cache without reaching the node
            let pages = self.cache.page_span(&key).max(1);
            (node.start_round(), pages)
        };
        tracing::debug!(scope = %key, pages, "refreshing node");
        self.run_round(key, round, 1..=pages).await
    }

    /// Fetches the next page of an expanded node, if the server has more
    pub async fn load_more(&self, key: ScopeKey) -> Result<(), Error> {
        let (round, next) = {
            let mut nodes = self.nodes.lock();
            let Some(node) = nodes.get_mut(&key) else {
                return Ok(());
            };
            if !matches!(node.disclosure, Disclosure::Expanded(_)) || node.loading_more {
                return Ok(());
            }
            let Some((last, entry)) = self.cache.last_page(&key) else {
                return Ok(());
            };
            if !entry.has_more() {
                return Ok(());
            }
            node.loading_more = true;
            node.more_error = None;
            (node.start_round(), last.page + 1)
        };
        self.run_round(key, round, next..=next).await
    }

    pub fn unmount(&self, key: ScopeKey) {
        unmount_locked(&mut self.nodes.lock(), key);
    }

    /// Flips the reply composer of a comment, returning whether it is open
    pub fn toggle_composer(&self, comment: CommentId) -> bool {
        let key = self.node_key(comment);
        let mut nodes = self.nodes.lock();
        let node = nodes.entry(key).or_insert_with(|| self.new_node());
        node.composer_open = !node.composer_open;
        let open = node.composer_open;
        if node.is_idle() {
            nodes.remove(&key);
        }
        open
    }

    /// Opens the thread and expands every comment with replies, level by
    /// level, until `depth` levels are shown or the depth bound is reached
    pub async fn expand_to_depth(&self, depth: usize) -> Result<(), Error> {
        self.open().await?;
        let mut level = self.children(&self.root_key());
        for _ in 1..depth.min(self.config.max_depth + 1) {
            let with_replies = level
                .iter()
                .filter(|c| c.reply_count > 0)
                .map(|c| c.id)
                .collect::<Vec<_>>();
            if with_replies.is_empty() {
                break;
            }
            for res in join_all(with_replies.iter().map(|c| self.expand(*c))).await {
                res?;
            }
            level = with_replies
                .into_iter()
                .flat_map(|c| self.children(&self.node_key(c)))
                .collect();
        }
        Ok(())
    }

    async fn run_round(
        &self,
        key: ScopeKey,
        round: Round,
        pages: RangeInclusive<u32>,
    ) -> Result<(), Error> {
        let mut failure = None;
        for page in pages {
            let ticket = self.cache.begin_fetch(key, self.page(page));
            let result = self.fetch(key, ticket.page()).await;
            let err = result.as_ref().err().cloned();
            if self.cache.finish_fetch(&ticket, result) == FetchOutcome::Superseded {
                tracing::debug!(scope = %key, page, "fetch superseded by a newer request");
            }
            if let Some(e) = err {
                failure = Some(e);
                break;
            }
        }
        let auth_failed = failure == Some(Error::Auth);
        self.settle(key, round, failure);
        match auth_failed {
            true => Err(Error::Auth),
            false => Ok(()),
        }
    }

    fn settle(&self, key: ScopeKey, round: Round, failure: Option<Error>) {
        let mut nodes = self.nodes.lock();
        let Some(node) = nodes.get_mut(&key) else {
            tracing::warn!(scope = %key, "dropping fetch result for unmounted node");
            return;
        };
        if !node.owns(round) {
            tracing::warn!(scope = %key, "dropping fetch result of a superseded round");
            return;
        }
        let was_more = std::mem::replace(&mut node.loading_more, false);
        match failure {
            None => {
                let previous = match &node.disclosure {
                    Disclosure::Expanded(ids) => ids.clone(),
                    _ => Vec::new(),
                };
                let ids = self.cache.scope_ids(&key);
                if let Some(next) = node.disclosure.on(Transition::Fetched(ids.clone())) {
                    node.disclosure = next;
                }
                node.more_error = None;
                tracing::debug!(scope = %key, children = ids.len(), "node settled");
                for gone in previous.into_iter().filter(|id| !ids.contains(id)) {
                    unmount_locked(&mut nodes, ScopeKey::Replies(key.post(), gone));
                }
            }
            Some(e) if was_more => node.more_error = Some(e),
            Some(e) => {
                tracing::info!(scope = %key, error = %e, "fetching comments failed");
                node.removed = e == Error::NotFound;
                if let Some(next) = node.disclosure.on(Transition::Failed(e)) {
                    node.disclosure = next;
                }
            }
        }
    }
}
