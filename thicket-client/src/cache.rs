use std::{
    collections::{BTreeMap, HashMap},
    fmt,
};

use parking_lot::Mutex;

use crate::api::{Comment, CommentId, Error, Page, PageRequest, PaginationMeta, PostId};

/// Address of a list of comments
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum ScopeKey {
    /// Top-level comments of a post
    TopLevel(PostId),

    /// Replies of one comment
    Replies(PostId, CommentId),
}

impl ScopeKey {
    pub fn post(&self) -> PostId {
        match self {
            ScopeKey::TopLevel(p) | ScopeKey::Replies(p, _) => *p,
        }
    }

    pub fn parent(&self) -> Option<CommentId> {
        match self {
            ScopeKey::TopLevel(_) => None,
            ScopeKey::Replies(_, c) => Some(*c),
        }
    }

    /// The scope `c` is listed in
    pub fn owning(c: &Comment) -> ScopeKey {
        match c.parent_comment_id {
            None => ScopeKey::TopLevel(c.post_id),
            Some(parent) => ScopeKey::Replies(c.post_id, parent),
        }
    }

    /// The scope listing the replies of `c`
    pub fn replies_of(c: &Comment) -> ScopeKey {
        ScopeKey::Replies(c.post_id, c.id)
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeKey::TopLevel(p) => write!(f, "post:{}", p.0),
            ScopeKey::Replies(p, c) => write!(f, "comment:{}:{}", p.0, c.0),
        }
    }
}

/// Set of scopes to mark stale
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Invalidation {
    Scope(ScopeKey),

    /// Every reply scope of the post, but not its top-level list
    AllReplies(PostId),

    /// Both the top-level list and every reply scope of the post
    Post(PostId),
}

impl Invalidation {
    pub fn matches(&self, key: &ScopeKey) -> bool {
        match (self, key) {
            (Invalidation::Scope(s), k) => s == k,
            (Invalidation::AllReplies(p), ScopeKey::Replies(kp, _)) => p == kp,
            (Invalidation::AllReplies(_), ScopeKey::TopLevel(_)) => false,
            (Invalidation::Post(p), k) => *p == k.post(),
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CacheEntry {
    pub comments: Vec<Comment>,
    pub meta: Option<PaginationMeta>,
    pub loading: bool,
    pub error: Option<Error>,

    /// Set by invalidation, cleared by a fetch issued after it
    pub stale: bool,
}

impl CacheEntry {
    fn empty() -> CacheEntry {
        CacheEntry {
            comments: Vec::new(),
            meta: None,
            loading: false,
            error: None,
            stale: false,
        }
    }

    pub fn is_fresh(&self) -> bool {
        !self.stale && !self.loading && self.error.is_none() && self.meta.is_some()
    }

    pub fn has_more(&self) -> bool {
        self.meta
            .map(|m| m.page_number < m.total_pages)
            .unwrap_or(false)
    }
}

/// Proof that a fetch was issued, needed to write its result
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FetchTicket {
    key: ScopeKey,
    page: PageRequest,
    seq: u64,
    generation: u64,
}

impl FetchTicket {
    pub fn key(&self) -> ScopeKey {
        self.key
    }

    pub fn page(&self) -> PageRequest {
        self.page
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum FetchOutcome {
    Applied,

    /// A newer fetch for the same key was issued, or the scope was evicted
    Superseded,
}

#[derive(Debug)]
struct Slot {
    entry: CacheEntry,
    // seq of the latest fetch issued (or direct write) for this slot
    issued: u64,
}

#[derive(Debug, Default)]
struct Scope {
    pages: BTreeMap<PageRequest, Slot>,
    // bumped on each invalidation
    generation: u64,
}

#[derive(Debug, Default)]
struct Inner {
    scopes: HashMap<ScopeKey, Scope>,
    next_seq: u64,
}

impl Inner {
    fn next_seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }
}

/// Comment records, keyed by scope and page
///
/// Entries live until invalidated, evicted, or the cache is dropped.
#[derive(Debug, Default)]
pub struct CommentCache(Mutex<Inner>);

impl CommentCache {
    pub fn new() -> CommentCache {
        CommentCache::default()
    }

    pub fn get(&self, key: &ScopeKey, page: PageRequest) -> Option<CacheEntry> {
        self.0
            .lock()
            .scopes
            .get(key)
            .and_then(|s| s.pages.get(&page))
            .map(|slot| slot.entry.clone())
    }

    /// Writes a page directly, superseding any fetch in flight for it
    pub fn set(&self, key: ScopeKey, page: PageRequest, data: Page<Comment>) {
        let mut inner = self.0.lock();
        let seq = inner.next_seq();
        let slot = inner
            .scopes
            .entry(key)
            .or_default()
            .pages
            .entry(page)
            .or_insert_with(|| Slot {
                entry: CacheEntry::empty(),
                issued: 0,
            });
        slot.issued = seq;
        slot.entry = CacheEntry {
            comments: data.items,
            meta: Some(data.meta),
            loading: false,
            error: None,
            stale: false,
        };
    }

    /// Marks every matching scope stale, keeping its data for display until
    /// the refetch lands, and returns the scopes that were hit
    pub fn invalidate(&self, inv: Invalidation) -> Vec<ScopeKey> {
        let mut inner = self.0.lock();
        let mut hit = Vec::new();
        for (key, scope) in inner.scopes.iter_mut().filter(|(k, _)| inv.matches(k)) {
            scope.generation += 1;
            for slot in scope.pages.values_mut() {
                slot.entry.stale = true;
            }
            hit.push(*key);
        }
        hit.sort();
        tracing::debug!(?inv, scopes = hit.len(), "invalidated comment scopes");
        hit
    }

    /// Drops a whole scope
    pub fn evict(&self, key: &ScopeKey) {
        self.0.lock().scopes.remove(key);
    }

    pub fn begin_fetch(&self, key: ScopeKey, page: PageRequest) -> FetchTicket {
        let mut inner = self.0.lock();
        let seq = inner.next_seq();
        let scope = inner.scopes.entry(key).or_default();
        let generation = scope.generation;
        let slot = scope.pages.entry(page).or_insert_with(|| Slot {
            entry: CacheEntry::empty(),
            issued: 0,
        });
        slot.issued = seq;
        slot.entry.loading = true;
        FetchTicket {
            key,
            page,
            seq,
            generation,
        }
    }

    /// Applies the result of a fetch, unless a newer one was issued since
    ///
    /// Ordering is by issue sequence, never by arrival: a slow early
    /// response cannot overwrite the result of a later request.
    pub fn finish_fetch(
        &self,
        ticket: &FetchTicket,
        result: Result<Page<Comment>, Error>,
    ) -> FetchOutcome {
        let mut inner = self.0.lock();
        let Some(scope) = inner.scopes.get_mut(&ticket.key) else {
            return FetchOutcome::Superseded;
        };
        let generation = scope.generation;
        let Some(slot) = scope.pages.get_mut(&ticket.page) else {
            return FetchOutcome::Superseded;
        };
        if slot.issued != ticket.seq {
            tracing::debug!(
                scope = %ticket.key,
                page = ticket.page.page,
                seq = ticket.seq,
                newest = slot.issued,
                "dropping superseded fetch result"
            );
            return FetchOutcome::Superseded;
        }
        let entry = &mut slot.entry;
        entry.loading = false;
        match result {
            Ok(data) => {
                entry.comments = data.items;
                entry.meta = Some(data.meta);
                entry.error = None;
                // invalidated while in flight: the data may predate the change
                entry.stale = ticket.generation != generation;
            }
            Err(Error::NotFound) => {
                entry.comments = Vec::new();
                entry.meta = None;
                entry.error = Some(Error::NotFound);
            }
            Err(e) => entry.error = Some(e),
        }
        FetchOutcome::Applied
    }

    /// All loaded comments of a scope, pages in order
    pub fn scope_comments(&self, key: &ScopeKey) -> Vec<Comment> {
        self.0
            .lock()
            .scopes
            .get(key)
            .map(|s| {
                s.pages
                    .values()
                    .flat_map(|slot| slot.entry.comments.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn scope_ids(&self, key: &ScopeKey) -> Vec<CommentId> {
        self.0
            .lock()
            .scopes
            .get(key)
            .map(|s| {
                s.pages
                    .values()
                    .flat_map(|slot| slot.entry.comments.iter().map(|c| c.id))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of pages currently holding data for the scope
    pub fn pages_loaded(&self, key: &ScopeKey) -> u32 {
        self.0
            .lock()
            .scopes
            .get(key)
            .map(|s| s.pages.values().filter(|p| p.entry.meta.is_some()).count() as u32)
            .unwrap_or(0)
    }

    /// Highest page number holding data or with a fetch in flight
    pub fn page_span(&self, key: &ScopeKey) -> u32 {
        self.0
            .lock()
            .scopes
            .get(key)
            .and_then(|s| {
                s.pages
                    .iter()
                    .filter(|(_, slot)| slot.entry.meta.is_some() || slot.entry.loading)
                    .map(|(page, _)| page.page)
                    .max()
            })
            .unwrap_or(0)
    }

    /// Entry of the last loaded page of the scope
    pub fn last_page(&self, key: &ScopeKey) -> Option<(PageRequest, CacheEntry)> {
        self.0.lock().scopes.get(key).and_then(|s| {
            s.pages
                .iter()
                .filter(|(_, slot)| slot.entry.meta.is_some())
                .last()
                .map(|(page, slot)| (*page, slot.entry.clone()))
        })
    }

    /// Applies `f` to every cached copy of the comment, returning how many
    /// were found
    pub fn update_comment(&self, id: CommentId, mut f: impl FnMut(&mut Comment)) -> usize {
        let mut inner = self.0.lock();
        let mut found = 0;
        for c in inner
            .scopes
            .values_mut()
            .flat_map(|s| s.pages.values_mut())
            .flat_map(|slot| slot.entry.comments.iter_mut())
            .filter(|c| c.id == id)
        {
            f(c);
            found += 1;
        }
        found
    }

    /// Scope the comment is currently cached in
    pub fn locate(&self, id: CommentId) -> Option<ScopeKey> {
        self.0
            .lock()
            .scopes
            .iter()
            .find(|(_, s)| {
                s.pages
                    .values()
                    .any(|slot| slot.entry.comments.iter().any(|c| c.id == id))
            })
            .map(|(k, _)| *k)
    }

    pub fn comment(&self, id: CommentId) -> Option<Comment> {
        self.0
            .lock()
            .scopes
            .values()
            .flat_map(|s| s.pages.values())
            .flat_map(|slot| slot.entry.comments.iter())
            .find(|c| c.id == id)
            .cloned()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use chrono::{TimeZone, Utc};

    use super::*;
    use crate::api::{UserId, Uuid};

    pub(crate) fn comment(post: PostId, parent: Option<CommentId>, text: &str) -> Comment {
        Comment {
            id: CommentId(Uuid::new_v4()),
            post_id: post,
            content: Some(String::from(text)),
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            updated_at: None,
            is_edited: false,
            author_id: UserId::stub(),
            author_display_name: String::from("ada"),
            author_avatar_ref: None,
            like_count: 0,
            liked_by_current_user: false,
            reply_count: 0,
            parent_comment_id: parent,
        }
    }

    pub(crate) fn page_of(items: Vec<Comment>) -> Page<Comment> {
        let meta = PaginationMeta::single(PageRequest::default(), items.len() as u64);
        Page { items, meta }
    }

    fn post() -> PostId {
        PostId(Uuid::new_v4())
    }

    #[test]
    fn scope_keys_display() {
        let p = PostId::stub();
        let c = CommentId::stub();
        assert_eq!(
            ScopeKey::TopLevel(p).to_string(),
            "post:ffffffff-ffff-ffff-ffff-ffffffffffff"
        );
        assert_eq!(
            ScopeKey::Replies(p, c).to_string(),
            "comment:ffffffff-ffff-ffff-ffff-ffffffffffff:ffffffff-ffff-ffff-ffff-ffffffffffff"
        );
        let top = comment(p, None, "top");
        let reply = comment(p, Some(top.id), "reply");
        assert_eq!(ScopeKey::owning(&top), ScopeKey::TopLevel(p));
        assert_eq!(ScopeKey::owning(&reply), ScopeKey::replies_of(&top));
    }

    #[test]
    fn invalidation_dimensions_are_independent() {
        let cache = CommentCache::new();
        let (p, other) = (post(), post());
        let c1 = comment(p, None, "c1");
        let c2 = comment(p, None, "c2");
        let top = ScopeKey::TopLevel(p);
        let r1 = ScopeKey::replies_of(&c1);
        let r2 = ScopeKey::replies_of(&c2);
        let elsewhere = ScopeKey::TopLevel(other);
        for key in [top, r1, r2, elsewhere] {
            cache.set(key, PageRequest::default(), page_of(vec![]));
        }

        assert_eq!(cache.invalidate(Invalidation::Scope(top)), vec![top]);
        assert!(!cache.get(&r1, PageRequest::default()).unwrap().stale);
        assert!(!cache.get(&r2, PageRequest::default()).unwrap().stale);

        let mut hit = cache.invalidate(Invalidation::AllReplies(p));
        hit.sort();
        let mut expected = vec![r1, r2];
        expected.sort();
        assert_eq!(hit, expected);
        assert!(!cache
            .get(&elsewhere, PageRequest::default())
            .unwrap()
            .stale);

        assert_eq!(cache.invalidate(Invalidation::Post(p)).len(), 3);
        assert!(!cache
            .get(&elsewhere, PageRequest::default())
            .unwrap()
            .stale);
    }

    #[test]
    fn later_request_wins() {
        let cache = CommentCache::new();
        let p = post();
        let key = ScopeKey::TopLevel(p);
        let page = PageRequest::default();
        let old = comment(p, None, "old");
        let new = comment(p, None, "new");

        let first = cache.begin_fetch(key, page);
        let second = cache.begin_fetch(key, page);
        assert!(second.seq() > first.seq());

        assert_eq!(
            cache.finish_fetch(&second, Ok(page_of(vec![new.clone()]))),
            FetchOutcome::Applied
        );
        assert_eq!(
            cache.finish_fetch(&first, Ok(page_of(vec![old]))),
            FetchOutcome::Superseded
        );
        let entry = cache.get(&key, page).unwrap();
        assert_eq!(entry.comments, vec![new]);
        assert!(entry.is_fresh());
    }

    #[test]
    fn invalidated_in_flight_stays_stale() {
        let cache = CommentCache::new();
        let key = ScopeKey::TopLevel(post());
        let page = PageRequest::default();
        let ticket = cache.begin_fetch(key, page);
        assert!(cache.get(&key, page).unwrap().loading);
        cache.invalidate(Invalidation::Scope(key));
        assert_eq!(
            cache.finish_fetch(&ticket, Ok(page_of(vec![]))),
            FetchOutcome::Applied
        );
        let entry = cache.get(&key, page).unwrap();
        assert!(entry.stale);
        assert!(!entry.is_fresh());
    }

    #[test]
    fn errors_keep_data_except_not_found() {
        let cache = CommentCache::new();
        let p = post();
        let key = ScopeKey::TopLevel(p);
        let page = PageRequest::default();
        cache.set(key, page, page_of(vec![comment(p, None, "kept")]));

        let t = cache.begin_fetch(key, page);
        cache.finish_fetch(&t, Err(Error::Network(String::from("timeout"))));
        let entry = cache.get(&key, page).unwrap();
        assert_eq!(entry.comments.len(), 1);
        assert_eq!(entry.error, Some(Error::Network(String::from("timeout"))));

        let t = cache.begin_fetch(key, page);
        cache.finish_fetch(&t, Err(Error::NotFound));
        let entry = cache.get(&key, page).unwrap();
        assert!(entry.comments.is_empty());
        assert_eq!(entry.error, Some(Error::NotFound));
    }

    #[test]
    fn evicted_scope_drops_late_results() {
        let cache = CommentCache::new();
        let key = ScopeKey::TopLevel(post());
        let t = cache.begin_fetch(key, PageRequest::default());
        cache.evict(&key);
        assert_eq!(
            cache.finish_fetch(&t, Ok(page_of(vec![]))),
            FetchOutcome::Superseded
        );
        assert!(cache.get(&key, PageRequest::default()).is_none());
    }

    #[test]
    fn like_update_hits_every_copy() {
        let cache = CommentCache::new();
        let p = post();
        let c = comment(p, None, "liked");
        let id = c.id;
        cache.set(ScopeKey::TopLevel(p), PageRequest::default(), page_of(vec![c]));
        let n = cache.update_comment(id, |c| {
            c.like_count += 1;
            c.liked_by_current_user = true;
        });
        assert_eq!(n, 1);
        let c = cache.comment(id).unwrap();
        assert_eq!(c.like_count, 1);
        assert!(c.liked_by_current_user);
        assert_eq!(cache.locate(id), Some(ScopeKey::TopLevel(p)));
        assert_eq!(cache.update_comment(CommentId::stub(), |_| ()), 0);
    }

    #[test]
    fn pages_concatenate_in_order() {
        let cache = CommentCache::new();
        let p = post();
        let key = ScopeKey::TopLevel(p);
        let (a, b, c) = (
            comment(p, None, "a"),
            comment(p, None, "b"),
            comment(p, None, "c"),
        );
        let meta = |n| PaginationMeta {
            page_number: n,
            page_size: 2,
            total_pages: 2,
            total_items: 3,
        };
        cache.set(
            key,
            PageRequest::nth(2, 2),
            Page {
                items: vec![c.clone()],
                meta: meta(2),
            },
        );
        cache.set(
            key,
            PageRequest::nth(1, 2),
            Page {
                items: vec![a.clone(), b.clone()],
                meta: meta(1),
            },
        );
        assert_eq!(cache.scope_ids(&key), vec![a.id, b.id, c.id]);
        assert_eq!(cache.pages_loaded(&key), 2);
        let (last, entry) = cache.last_page(&key).unwrap();
        assert_eq!(last.page, 2);
        assert!(!entry.has_more());

        // a page still in flight counts towards the span but not as loaded
        cache.begin_fetch(key, PageRequest::nth(3, 2));
        assert_eq!(cache.pages_loaded(&key), 2);
        assert_eq!(cache.page_span(&key), 3);
        assert_eq!(cache.page_span(&ScopeKey::TopLevel(post())), 0);
    }
}
