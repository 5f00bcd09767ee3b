use std::future::Future;

use futures::future::join_all;

use crate::{
    api::{Comment, CommentEdit, CommentId, Error, LikeState, NewComment},
    CommentThread, Invalidation, PendingAction, ScopeKey,
};

impl CommentThread {
    /// Posts a comment, top-level when `parent` is `None`
    ///
    /// The new comment shows up once its scope is refetched, which happens
    /// right away when that scope is disclosed. The parent's own scope is
    /// refetched too, so its reply count follows.
    pub async fn create(&self, content: &str, parent: Option<CommentId>) -> Result<Comment, Error> {
        let node = parent.map_or_else(|| self.root_key(), |p| self.node_key(p));
        let new = NewComment {
            post_id: self.post,
            content: String::from(content),
            parent_comment_id: parent,
        };
        let created = self
            .act(node, PendingAction::Reply, async {
                new.validate()?;
                self.gateway.create_comment(&new).await
            })
            .await?;
        tracing::info!(comment = ?created.id, scope = %node, "created comment");

        let mut scopes = vec![node];
        if let Some(p) = parent {
            scopes.extend(self.cache.comment(p).map(|c| ScopeKey::owning(&c)));
            let mut nodes = self.nodes.lock();
            if let Some(n) = nodes.get_mut(&node) {
                n.composer_open = false;
                if n.is_idle() {
                    nodes.remove(&node);
                }
            }
        }
        self.refresh_scopes(scopes).await?;
        Ok(created)
    }

    pub async fn edit(&self, comment: CommentId, content: &str) -> Result<Comment, Error> {
        let edit = CommentEdit {
            content: String::from(content),
        };
        let edited = self
            .act(self.node_key(comment), PendingAction::Edit, async {
                edit.validate()?;
                self.gateway.edit_comment(comment, &edit).await
            })
            .await?;
        self.refresh_scopes(vec![ScopeKey::owning(&edited)]).await?;
        Ok(edited)
    }

    /// Deletes a comment, asking for confirmation is up to the caller
    ///
    /// Refetches the scope listing the comment and, for a reply, the scope
    /// listing its parent. The comment's own reply scope is left alone: it
    /// becomes unreachable once the comment drops out of its list.
    pub async fn remove(&self, comment: CommentId) -> Result<(), Error> {
        let known = self.cache.comment(comment);
        self.act(
            self.node_key(comment),
            PendingAction::Delete,
            self.gateway.delete_comment(comment),
        )
        .await?;
        tracing::info!(?comment, "deleted comment");

        match known {
            Some(c) => {
                let mut scopes = vec![ScopeKey::owning(&c)];
                if let Some(parent) = c.parent_comment_id.and_then(|p| self.cache.comment(p)) {
                    scopes.push(ScopeKey::owning(&parent));
                }
                self.refresh_scopes(scopes).await
            }
            // not cached: no way to tell where it was listed
            None => self.invalidate(Invalidation::Post(self.post)).await,
        }
    }

    /// Flips the like of the current user, updating every cached copy
    pub async fn toggle_like(&self, comment: CommentId) -> Result<LikeState, Error> {
        let state = self
            .act(
                self.node_key(comment),
                PendingAction::Like,
                self.gateway.toggle_like(comment),
            )
            .await?;
        self.cache.update_comment(comment, |c| {
            c.like_count = state.like_count;
            c.liked_by_current_user = state.liked_by_current_user;
        });
        Ok(state)
    }

    /// Marks the matching scopes stale and refetches the disclosed ones
    pub async fn invalidate(&self, inv: Invalidation) -> Result<(), Error> {
        let mut scopes = self.cache.invalidate(inv);
        scopes.extend(self.nodes.lock().keys().filter(|k| inv.matches(k)).copied());
        self.refresh_all(scopes).await
    }

    async fn refresh_scopes(&self, mut scopes: Vec<ScopeKey>) -> Result<(), Error> {
        scopes.sort();
        scopes.dedup();
        for key in &scopes {
            self.cache.invalidate(Invalidation::Scope(*key));
        }
        self.refresh_all(scopes).await
    }

    async fn refresh_all(&self, mut scopes: Vec<ScopeKey>) -> Result<(), Error> {
        scopes.sort();
        scopes.dedup();
        join_all(scopes.into_iter().map(|k| self.refresh(k)))
            .await
            .into_iter()
            .collect()
    }

    async fn act<T>(
        &self,
        key: ScopeKey,
        action: PendingAction,
        op: impl Future<Output = Result<T, Error>>,
    ) -> Result<T, Error> {
        {
            let mut nodes = self.nodes.lock();
            let node = nodes.entry(key).or_insert_with(|| self.new_node());
            node.pending = Some(action);
            node.mutation_error = None;
        }
        let res = op.await;
        if let Err(e) = &res {
            tracing::info!(scope = %key, ?action, error = %e, "mutation failed");
        }
        // the node may have been unmounted meanwhile
        let mut nodes = self.nodes.lock();
        if let Some(node) = nodes.get_mut(&key) {
            node.pending = None;
            node.mutation_error = res.as_ref().err().cloned();
            if node.is_idle() {
                nodes.remove(&key);
            }
        }
        drop(nodes);
        res
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use thicket_mock_server::{MockServer, Request};

    use crate::{
        api::{PageRequest, PostId, UserId},
        ClientConfig, CommentCache, CommentThread, Disclosure, Invalidation, PendingAction,
    };

    use super::*;

    fn setup() -> (Arc<MockServer>, UserId, PostId, CommentThread) {
        if std::env::var("RUST_LOG").is_ok() {
            let _ = tracing_subscriber::fmt::try_init();
        }
        let srv = Arc::new(MockServer::new());
        let me = srv.current_user();
        let post = srv.add_post();
        let t = CommentThread::new(
            post,
            srv.clone(),
            Arc::new(CommentCache::new()),
            ClientConfig::default(),
        );
        (srv, me, post, t)
    }

    #[tokio::test]
    async fn reply_refetches_expanded_parent() {
        let (srv, me, post, t) = setup();
        let c1 = srv.seed_comment(post, None, me, "c1");
        let r1 = srv.seed_comment(post, Some(c1), me, "r1");
        let r2 = srv.seed_comment(post, Some(c1), me, "r2");
        t.open().await.unwrap();
        t.expand(c1).await.unwrap();
        assert!(t.toggle_composer(c1));
        let key = t.node_key(c1);

        let hold = srv.hold(Request::Replies(c1));
        let (created, saw_loading) = tokio::join!(t.create("r3", Some(c1)), async {
            let mut saw = false;
            for _ in 0..10 {
                tokio::task::yield_now().await;
                if t.disclosure(&key) == Disclosure::Loading {
                    saw = true;
                    break;
                }
            }
            hold.release();
            saw
        });
        let r3 = created.unwrap().id;
        assert!(saw_loading);
        assert_eq!(t.disclosure(&key), Disclosure::Expanded(vec![r1, r2, r3]));
        assert_eq!(t.comment(c1).unwrap().reply_count, 3);

        let node = t.node(&key).unwrap();
        assert!(!node.composer_open);
        assert_eq!(node.pending, None);
        assert_eq!(node.mutation_error, None);
    }

    #[tokio::test]
    async fn reply_to_empty_parent_refetches() {
        let (srv, me, post, t) = setup();
        let c1 = srv.seed_comment(post, None, me, "c1");
        t.open().await.unwrap();
        t.expand(c1).await.unwrap();
        let key = t.node_key(c1);
        assert_eq!(t.disclosure(&key), Disclosure::ExpandedEmpty);

        let hold = srv.hold(Request::Replies(c1));
        let (created, saw_loading) = tokio::join!(t.create("first!", Some(c1)), async {
            let mut saw = false;
            for _ in 0..10 {
                tokio::task::yield_now().await;
                if t.disclosure(&key) == Disclosure::Loading {
                    saw = true;
                    break;
                }
            }
            hold.release();
            saw
        });
        let r = created.unwrap().id;
        assert!(saw_loading);
        assert_eq!(t.disclosure(&key), Disclosure::Expanded(vec![r]));
        assert_eq!(srv.request_count(Request::Replies(c1)), 2);
        assert_eq!(t.comment(c1).unwrap().reply_count, 1);
    }

    #[tokio::test]
    async fn settled_actions_leave_no_placeholder_nodes() {
        let (srv, me, post, t) = setup();
        let c1 = srv.seed_comment(post, None, me, "c1");
        let c2 = srv.seed_comment(post, None, me, "c2");
        let theirs = srv.seed_comment(post, None, srv.add_user("bob"), "c3");
        t.open().await.unwrap();
        let mounted = t.nodes_snapshot().len();

        t.toggle_like(c1).await.unwrap();
        t.toggle_like(c2).await.unwrap();
        t.edit(c1, "reworded").await.unwrap();
        t.create("reply", Some(c2)).await.unwrap();
        assert_eq!(t.nodes_snapshot().len(), mounted);
        assert!(t.node(&t.node_key(c1)).is_none());

        // a failure has to stay visible on its node
        assert_eq!(t.remove(theirs).await, Err(Error::PermissionDenied));
        assert_eq!(t.nodes_snapshot().len(), mounted + 1);
        assert_eq!(
            t.node(&t.node_key(theirs)).unwrap().mutation_error,
            Some(Error::PermissionDenied)
        );
    }

    #[tokio::test]
    async fn reply_to_collapsed_parent_only_refreshes_its_count() {
        let (srv, me, post, t) = setup();
        let c1 = srv.seed_comment(post, None, me, "c1");
        srv.seed_comment(post, Some(c1), me, "r1");
        t.open().await.unwrap();
        assert_eq!(t.comment(c1).unwrap().reply_count, 1);

        t.create("r2", Some(c1)).await.unwrap();
        assert_eq!(srv.request_count(Request::Replies(c1)), 0);
        assert_eq!(srv.request_count(Request::TopLevel(post)), 2);
        assert_eq!(t.comment(c1).unwrap().reply_count, 2);
        assert_eq!(t.disclosure(&t.node_key(c1)), Disclosure::Collapsed);
    }

    #[tokio::test]
    async fn top_level_create_appears_in_root() {
        let (srv, me, post, t) = setup();
        let c1 = srv.seed_comment(post, None, me, "c1");
        t.open().await.unwrap();
        let c2 = t.create("c2", None).await.unwrap();
        assert_eq!(c2.parent_comment_id, None);
        assert_eq!(
            t.disclosure(&t.root_key()),
            Disclosure::Expanded(vec![c1, c2.id])
        );
    }

    #[tokio::test]
    async fn invalid_content_never_reaches_the_network() {
        let (srv, me, post, t) = setup();
        let c1 = srv.seed_comment(post, None, me, "c1");
        t.open().await.unwrap();

        let err = t.create("  \n ", Some(c1)).await.unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(matches!(
            t.edit(c1, "").await,
            Err(Error::Validation(_))
        ));
        assert_eq!(srv.request_count(Request::Create), 0);
        assert_eq!(srv.request_count(Request::Edit(c1)), 0);

        let node = t.node(&t.node_key(c1)).unwrap();
        assert!(matches!(node.mutation_error, Some(Error::Validation(_))));
        assert_eq!(node.pending, None);
    }

    #[tokio::test]
    async fn deleting_top_level_leaves_reply_scope_cached() {
        let (srv, me, post, t) = setup();
        let c1 = srv.seed_comment(post, None, me, "c1");
        let c2 = srv.seed_comment(post, None, me, "c2");
        srv.seed_comment(post, Some(c1), me, "r1");
        t.open().await.unwrap();
        t.expand(c1).await.unwrap();
        let replies = t.node_key(c1);

        t.remove(c1).await.unwrap();
        assert_eq!(t.disclosure(&t.root_key()), Disclosure::Expanded(vec![c2]));
        assert_eq!(srv.request_count(Request::Replies(c1)), 1);
        // unreachable, but neither purged nor marked stale
        let entry = t.cache().get(&replies, PageRequest::default()).unwrap();
        assert_eq!(entry.comments.len(), 1);
        assert!(!entry.stale);
        assert!(t.node(&replies).is_none());
    }

    #[tokio::test]
    async fn deleting_reply_refreshes_both_levels() {
        let (srv, me, post, t) = setup();
        let c1 = srv.seed_comment(post, None, me, "c1");
        let r1 = srv.seed_comment(post, Some(c1), me, "r1");
        let r2 = srv.seed_comment(post, Some(c1), me, "r2");
        t.open().await.unwrap();
        t.expand(c1).await.unwrap();

        t.remove(r1).await.unwrap();
        assert_eq!(t.disclosure(&t.node_key(c1)), Disclosure::Expanded(vec![r2]));
        assert_eq!(t.comment(c1).unwrap().reply_count, 1);
        assert_eq!(srv.request_count(Request::TopLevel(post)), 2);
    }

    #[tokio::test]
    async fn failed_delete_is_reported_inline() {
        let (srv, _, post, t) = setup();
        let other = srv.add_user("mallory");
        let c1 = srv.seed_comment(post, None, other, "not yours");
        t.open().await.unwrap();

        assert_eq!(t.remove(c1).await, Err(Error::PermissionDenied));
        let node = t.node(&t.node_key(c1)).unwrap();
        assert_eq!(node.mutation_error, Some(Error::PermissionDenied));
        // no retry, no refetch
        assert_eq!(srv.request_count(Request::Delete(c1)), 1);
        assert_eq!(srv.request_count(Request::TopLevel(post)), 1);
    }

    #[tokio::test]
    async fn pending_action_is_visible_while_in_flight() {
        let (srv, me, post, t) = setup();
        let c1 = srv.seed_comment(post, None, me, "c1");
        t.open().await.unwrap();
        let hold = srv.hold(Request::Like(c1));
        let (res, pending) = tokio::join!(t.toggle_like(c1), async {
            tokio::task::yield_now().await;
            let pending = t.node(&t.node_key(c1)).and_then(|n| n.pending);
            hold.release();
            pending
        });
        res.unwrap();
        assert_eq!(pending, Some(PendingAction::Like));
    }

    #[tokio::test]
    async fn like_twice_restores_state() {
        let (srv, me, post, t) = setup();
        let c1 = srv.seed_comment(post, None, me, "c1");
        t.open().await.unwrap();
        let before = t.comment(c1).unwrap().like_state();

        let liked = t.toggle_like(c1).await.unwrap();
        assert!(liked.liked_by_current_user);
        assert_eq!(liked.like_count, before.like_count + 1);
        assert_eq!(t.comment(c1).unwrap().like_state(), liked);

        let back = t.toggle_like(c1).await.unwrap();
        assert_eq!(back, before);
        assert_eq!(t.comment(c1).unwrap().like_state(), before);
        // likes never refetch
        assert_eq!(srv.request_count(Request::TopLevel(post)), 1);
    }

    #[tokio::test]
    async fn edit_refetches_owning_scope() {
        let (srv, me, post, t) = setup();
        let c1 = srv.seed_comment(post, None, me, "typo");
        t.open().await.unwrap();
        let edited = t.edit(c1, "fixed").await.unwrap();
        assert!(edited.is_edited);
        let cached = t.comment(c1).unwrap();
        assert_eq!(cached.content.as_deref(), Some("fixed"));
        assert!(cached.is_edited);
    }

    #[tokio::test]
    async fn post_invalidation_refetches_every_disclosed_scope() {
        let (srv, me, post, t) = setup();
        let c1 = srv.seed_comment(post, None, me, "c1");
        srv.seed_comment(post, Some(c1), me, "r1");
        t.open().await.unwrap();
        t.expand(c1).await.unwrap();

        t.invalidate(Invalidation::Post(post)).await.unwrap();
        assert_eq!(srv.request_count(Request::TopLevel(post)), 2);
        assert_eq!(srv.request_count(Request::Replies(c1)), 2);
        assert!(t.cache().get(&t.root_key(), PageRequest::default()).unwrap().is_fresh());
    }
}
