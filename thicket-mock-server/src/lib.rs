use std::collections::{HashMap, HashSet, VecDeque};

use async_trait::async_trait;
use chrono::{Duration, TimeZone, Utc};
use parking_lot::Mutex;
use thicket_api::{
    Comment, CommentEdit, CommentId, Error, Gateway, LikeState, NewComment, Page, PageRequest,
    PaginationMeta, PostId, Time, UserId, Uuid,
};
use tokio::sync::oneshot;

/// In-memory backend, scriptable from tests
pub struct MockServer(Mutex<State>);

/// Identifies a kind of request, for scripting and counting
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Request {
    TopLevel(PostId),
    Replies(CommentId),
    Create,
    Edit(CommentId),
    Delete(CommentId),
    Like(CommentId),
}

/// Lets a held request complete, either explicitly or when dropped
pub struct Release(oneshot::Sender<()>);

impl Release {
    pub fn release(self) {
        let _ = self.0.send(());
    }
}

#[derive(Debug)]
struct StoredComment {
    id: CommentId,
    post: PostId,
    parent: Option<CommentId>,
    author: UserId,
    content: Option<String>,
    created_at: Time,
    updated_at: Option<Time>,
}

struct State {
    current_user: UserId,
    users: HashMap<UserId, String>,
    posts: HashSet<PostId>,
    // oldest first
    comments: Vec<StoredComment>,
    likes: HashSet<(UserId, CommentId)>,
    holds: HashMap<Request, VecDeque<oneshot::Receiver<()>>>,
    failures: HashMap<Request, VecDeque<Error>>,
    counts: HashMap<Request, usize>,
    session_expired: bool,
    clock: Time,
}

impl State {
    fn tick(&mut self) -> Time {
        self.clock = self.clock + Duration::seconds(1);
        self.clock
    }

    /// Counts the request and returns the scripted outcome for it, if any
    fn enter(&mut self, req: Request) -> Result<Option<oneshot::Receiver<()>>, Error> {
        *self.counts.entry(req).or_insert(0) += 1;
        if self.session_expired {
            return Err(Error::Auth);
        }
        if let Some(err) = self.failures.get_mut(&req).and_then(|f| f.pop_front()) {
            tracing::debug!(?req, %err, "mock server failing request");
            return Err(err);
        }
        Ok(self.holds.get_mut(&req).and_then(|h| h.pop_front()))
    }

    fn find(&self, id: CommentId) -> Result<&StoredComment, Error> {
        self.comments
            .iter()
            .find(|c| c.id == id)
            .ok_or(Error::NotFound)
    }

    fn render(&self, c: &StoredComment) -> Comment {
        Comment {
            id: c.id,
            post_id: c.post,
            content: c.content.clone(),
            created_at: c.created_at,
            updated_at: c.updated_at,
            is_edited: c.updated_at.is_some(),
            author_id: c.author,
            author_display_name: self
                .users
                .get(&c.author)
                .cloned()
                .unwrap_or_else(|| String::from("unknown")),
            author_avatar_ref: None,
            like_count: self.likes.iter().filter(|(_, l)| *l == c.id).count() as u64,
            liked_by_current_user: self.likes.contains(&(self.current_user, c.id)),
            reply_count: self
                .comments
                .iter()
                .filter(|r| r.parent == Some(c.id))
                .count() as u64,
            parent_comment_id: c.parent,
        }
    }

    fn page<'a>(
        &self,
        matching: impl Iterator<Item = &'a StoredComment>,
        req: PageRequest,
    ) -> Result<Page<Comment>, Error> {
        if req.page == 0 || req.page_size == 0 {
            return Err(Error::Validation(String::from(
                "page and pageSize must be positive",
            )));
        }
        let all = matching.collect::<Vec<_>>();
        let meta = PaginationMeta {
            page_number: req.page,
            page_size: req.page_size,
            total_pages: ((all.len() as u32) + req.page_size - 1) / req.page_size,
            total_items: all.len() as u64,
        };
        let items = all
            .into_iter()
            .skip(((req.page - 1) * req.page_size) as usize)
            .take(req.page_size as usize)
            .map(|c| self.render(c))
            .collect();
        Ok(Page { items, meta })
    }

    fn insert(
        &mut self,
        post: PostId,
        parent: Option<CommentId>,
        author: UserId,
        content: Option<String>,
    ) -> Result<CommentId, Error> {
        if !self.posts.contains(&post) {
            return Err(Error::NotFound);
        }
        if let Some(parent) = parent {
            if self.find(parent)?.post != post {
                return Err(Error::Validation(String::from(
                    "parent comment belongs to another post",
                )));
            }
        }
        let id = CommentId(Uuid::new_v4());
        let created_at = self.tick();
        self.comments.push(StoredComment {
            id,
            post,
            parent,
            author,
            content,
            created_at,
            updated_at: None,
        });
        Ok(id)
    }

    fn remove_subtree(&mut self, id: CommentId) {
        let mut doomed = vec![id];
        let mut i = 0;
        while i < doomed.len() {
            let parent = doomed[i];
            doomed.extend(
                self.comments
                    .iter()
                    .filter(|c| c.parent == Some(parent))
                    .map(|c| c.id),
            );
            i += 1;
        }
        self.comments.retain(|c| !doomed.contains(&c.id));
        self.likes.retain(|(_, c)| !doomed.contains(c));
    }
}

impl MockServer {
    pub fn new() -> MockServer {
        let me = UserId(Uuid::new_v4());
        let mut users = HashMap::new();
        users.insert(me, String::from("tester"));
        MockServer(Mutex::new(State {
            current_user: me,
            users,
            posts: HashSet::new(),
            comments: Vec::new(),
            likes: HashSet::new(),
            holds: HashMap::new(),
            failures: HashMap::new(),
            counts: HashMap::new(),
            session_expired: false,
            clock: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }))
    }

    /// The user requests are authenticated as
    pub fn current_user(&self) -> UserId {
        self.0.lock().current_user
    }

    pub fn add_user(&self, name: &str) -> UserId {
        let id = UserId(Uuid::new_v4());
        self.0.lock().users.insert(id, String::from(name));
        id
    }

    pub fn act_as(&self, user: UserId) {
        self.0.lock().current_user = user;
    }

    pub fn add_post(&self) -> PostId {
        let id = PostId(Uuid::new_v4());
        self.0.lock().posts.insert(id);
        id
    }

    /// Inserts a comment directly, bypassing scripting and counting
    ///
    /// Panics if the post or parent does not exist.
    pub fn seed_comment(
        &self,
        post: PostId,
        parent: Option<CommentId>,
        author: UserId,
        content: &str,
    ) -> CommentId {
        self.0
            .lock()
            .insert(post, parent, author, Some(String::from(content)))
            .unwrap_or_else(|e| panic!("seeding comment on {post:?}/{parent:?}: {e}"))
    }

    /// Blanks a comment's content the way moderation does
    pub fn redact(&self, id: CommentId) {
        let mut st = self.0.lock();
        if let Some(c) = st.comments.iter_mut().find(|c| c.id == id) {
            c.content = None;
        }
    }

    /// Removes a comment and its replies without going through the gateway
    pub fn purge(&self, id: CommentId) {
        self.0.lock().remove_subtree(id);
    }

    /// The next matching request computes its response immediately, but
    /// only returns it once the returned handle is released or dropped
    pub fn hold(&self, req: Request) -> Release {
        let (send, recv) = oneshot::channel();
        self.0
            .lock()
            .holds
            .entry(req)
            .or_insert_with(VecDeque::new)
            .push_back(recv);
        Release(send)
    }

    pub fn fail_next(&self, req: Request, err: Error) {
        self.0
            .lock()
            .failures
            .entry(req)
            .or_insert_with(VecDeque::new)
            .push_back(err);
    }

    pub fn request_count(&self, req: Request) -> usize {
        self.0.lock().counts.get(&req).copied().unwrap_or(0)
    }

    /// Every request from now on fails with `Error::Auth`
    pub fn expire_session(&self) {
        self.0.lock().session_expired = true;
    }

    pub fn comment(&self, id: CommentId) -> Option<Comment> {
        let st = self.0.lock();
        st.find(id).ok().map(|c| st.render(c))
    }
}

impl Default for MockServer {
    fn default() -> MockServer {
        MockServer::new()
    }
}

async fn wait(hold: Option<oneshot::Receiver<()>>) {
    if let Some(hold) = hold {
        // a dropped release also lets the request through
        let _ = hold.await;
    }
}

#[async_trait]
impl Gateway for MockServer {
    async fn fetch_top_level(
        &self,
        post: PostId,
        page: PageRequest,
    ) -> Result<Page<Comment>, Error> {
        let (hold, res) = {
            let mut st = self.0.lock();
            let hold = st.enter(Request::TopLevel(post))?;
            let res = if st.posts.contains(&post) {
                st.page(
                    st.comments
                        .iter()
                        .filter(|c| c.post == post && c.parent.is_none()),
                    page,
                )
            } else {
                Err(Error::NotFound)
            };
            (hold, res)
        };
        wait(hold).await;
        res
    }

    async fn fetch_replies(
        &self,
        post: PostId,
        comment: CommentId,
        page: PageRequest,
    ) -> Result<Page<Comment>, Error> {
        let (hold, res) = {
            let mut st = self.0.lock();
            let hold = st.enter(Request::Replies(comment))?;
            let res = match st.find(comment) {
                Ok(c) if c.post == post => st.page(
                    st.comments.iter().filter(|r| r.parent == Some(comment)),
                    page,
                ),
                _ => Err(Error::NotFound),
            };
            (hold, res)
        };
        wait(hold).await;
        res
    }

    async fn create_comment(&self, c: &NewComment) -> Result<Comment, Error> {
        let (hold, res) = {
            let mut st = self.0.lock();
            let hold = st.enter(Request::Create)?;
            let res = c.validate().and_then(|()| {
                let author = st.current_user;
                let id = st.insert(
                    c.post_id,
                    c.parent_comment_id,
                    author,
                    Some(c.content.clone()),
                )?;
                let stored = st.find(id)?;
                Ok(st.render(stored))
            });
            (hold, res)
        };
        wait(hold).await;
        res
    }

    async fn edit_comment(&self, comment: CommentId, e: &CommentEdit) -> Result<Comment, Error> {
        let (hold, res) = {
            let mut st = self.0.lock();
            let hold = st.enter(Request::Edit(comment))?;
            let res = e.validate().and_then(|()| {
                if st.find(comment)?.author != st.current_user {
                    return Err(Error::PermissionDenied);
                }
                let now = st.tick();
                let stored = st
                    .comments
                    .iter_mut()
                    .find(|c| c.id == comment)
                    .ok_or(Error::NotFound)?;
                stored.content = Some(e.content.clone());
                stored.updated_at = Some(now);
                let stored = st.find(comment)?;
                Ok(st.render(stored))
            });
            (hold, res)
        };
        wait(hold).await;
        res
    }

    async fn delete_comment(&self, comment: CommentId) -> Result<(), Error> {
        let (hold, res) = {
            let mut st = self.0.lock();
            let hold = st.enter(Request::Delete(comment))?;
            let res = st.find(comment).and_then(|c| {
                if c.author != st.current_user {
                    Err(Error::PermissionDenied)
                } else {
                    Ok(())
                }
            });
            if res.is_ok() {
                st.remove_subtree(comment);
            }
            (hold, res)
        };
        wait(hold).await;
        res
    }

    async fn toggle_like(&self, comment: CommentId) -> Result<LikeState, Error> {
        let (hold, res) = {
            let mut st = self.0.lock();
            let hold = st.enter(Request::Like(comment))?;
            let res = if st.find(comment).is_ok() {
                let key = (st.current_user, comment);
                if !st.likes.remove(&key) {
                    st.likes.insert(key);
                }
                st.find(comment).map(|c| st.render(c).like_state())
            } else {
                Err(Error::NotFound)
            };
            (hold, res)
        };
        wait(hold).await;
        res
    }
}
