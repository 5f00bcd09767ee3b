use std::{collections::HashMap, fmt};

use crate::{
    api::{Comment, Error, PostId},
    CommentThread, Disclosure, NodeState, PendingAction, ScopeKey,
};

/// Where a node sits among its loaded siblings
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Connectors {
    pub is_first: bool,
    pub is_last: bool,

    /// The server reports no replies
    pub is_leaf: bool,
}

#[derive(Clone, Debug, PartialEq)]
pub enum NodeBody {
    Hidden,
    Loading,
    Empty { removed: bool },
    Failed { message: String, retryable: bool },
    Children(Vec<RenderedNode>),
}

impl NodeBody {
    pub fn children(&self) -> &[RenderedNode] {
        match self {
            NodeBody::Children(c) => c,
            _ => &[],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RenderedNode {
    pub comment: Comment,

    /// 0 for top-level comments
    pub depth: usize,

    pub connectors: Connectors,
    pub can_reply: bool,
    pub view_replies: bool,

    /// A refetch is in flight, the children shown are the previous ones
    pub refreshing: bool,

    pub has_more: bool,
    pub loading_more: bool,
    pub more_error: Option<String>,

    pub composer_open: bool,
    pub pending: Option<PendingAction>,

    /// Inline failure of the last mutation on this comment
    pub error: Option<Error>,

    pub body: NodeBody,
}

/// View of a thread derived from the cache and node states, top-level
/// comments in `body`
#[derive(Clone, Debug, PartialEq)]
pub struct RenderedThread {
    pub post: PostId,
    pub body: NodeBody,
    pub has_more: bool,
    pub max_depth: usize,
}

impl RenderedThread {
    /// Every rendered node, depth-first in display order
    pub fn nodes(&self) -> Vec<&RenderedNode> {
        fn walk<'a>(body: &'a NodeBody, out: &mut Vec<&'a RenderedNode>) {
            for n in body.children() {
                out.push(n);
                walk(&n.body, out);
            }
        }
        let mut out = Vec::new();
        walk(&self.body, &mut out);
        out
    }
}

struct Ctx<'a> {
    thread: &'a CommentThread,
    nodes: HashMap<ScopeKey, NodeState>,
    max_depth: usize,
}

impl Ctx<'_> {
    fn has_more(&self, key: &ScopeKey) -> bool {
        self.thread
            .cache
            .last_page(key)
            .map_or(false, |(_, entry)| entry.has_more())
    }

    /// Body of a disclosed scope whose children sit at `depth`
    fn body(&self, key: &ScopeKey, state: &NodeState, depth: usize) -> (NodeBody, bool) {
        match &state.disclosure {
            Disclosure::Collapsed => (NodeBody::Hidden, false),
            Disclosure::Loading => {
                // keep showing what was there while refetching
                let previous = self.thread.cache.scope_comments(key);
                match previous.is_empty() {
                    true => (NodeBody::Loading, false),
                    false => (NodeBody::Children(self.children(&previous, depth)), true),
                }
            }
            Disclosure::ExpandedEmpty => (
                NodeBody::Empty {
                    removed: state.removed,
                },
                false,
            ),
            Disclosure::Expanded(ids) => {
                let loaded = self.thread.cache.scope_comments(key);
                let listed = ids
                    .iter()
                    .filter_map(|id| loaded.iter().find(|c| c.id == *id).cloned())
                    .collect::<Vec<_>>();
                (NodeBody::Children(self.children(&listed, depth)), false)
            }
            Disclosure::Error(e) => (
                NodeBody::Failed {
                    message: e.to_string(),
                    retryable: e.is_retryable(),
                },
                false,
            ),
        }
    }

    fn children(&self, siblings: &[Comment], depth: usize) -> Vec<RenderedNode> {
        let last = siblings.len().saturating_sub(1);
        siblings
            .iter()
            .enumerate()
            .map(|(i, c)| self.node(c, depth, i == 0, i == last))
            .collect()
    }

    fn node(&self, comment: &Comment, depth: usize, is_first: bool, is_last: bool) -> RenderedNode {
        let key = ScopeKey::replies_of(comment);
        let state = self.nodes.get(&key);
        let within = depth < self.max_depth;
        let connectors = Connectors {
            is_first,
            is_last,
            is_leaf: comment.is_leaf(),
        };

        let (body, refreshing) = match state {
            Some(s) if within && s.shown => self.body(&key, s, depth + 1),
            _ => (NodeBody::Hidden, false),
        };
        let open = !matches!(body, NodeBody::Hidden);

        RenderedNode {
            comment: comment.clone(),
            depth,
            connectors,
            can_reply: within,
            view_replies: within && !open && !comment.is_leaf(),
            refreshing,
            has_more: open && self.has_more(&key),
            loading_more: state.map_or(false, |s| s.loading_more),
            more_error: state.and_then(|s| s.more_error.as_ref().map(|e| e.to_string())),
            composer_open: within && state.map_or(false, |s| s.composer_open),
            pending: state.and_then(|s| s.pending),
            error: state.and_then(|s| s.mutation_error.clone()),
            body,
        }
    }
}

/// Derives the view of the whole thread
///
/// Reads the node states once, then walks the cache recursively from the
/// top-level scope. Siblings keep the order the server returned them in.
pub fn render(thread: &CommentThread) -> RenderedThread {
    let ctx = Ctx {
        thread,
        nodes: thread.nodes_snapshot(),
        max_depth: thread.config.max_depth,
    };
    let root = thread.root_key();
    let (body, _) = match ctx.nodes.get(&root) {
        Some(state) => ctx.body(&root, state, 0),
        None => (NodeBody::Hidden, false),
    };
    let has_more = !matches!(body, NodeBody::Hidden) && ctx.has_more(&root);
    RenderedThread {
        post: thread.post,
        body,
        has_more,
        max_depth: ctx.max_depth,
    }
}

fn write_body(f: &mut fmt::Formatter<'_>, body: &NodeBody, prefix: &str) -> fmt::Result {
    match body {
        NodeBody::Hidden => Ok(()),
        NodeBody::Loading => writeln!(f, "{prefix}└─ loading…"),
        NodeBody::Empty { removed: true } => writeln!(f, "{prefix}└─ (removed)"),
        NodeBody::Empty { removed: false } => writeln!(f, "{prefix}└─ (no replies)"),
        NodeBody::Failed { message, retryable } => {
            let hint = if *retryable { ", retry to reload" } else { "" };
            writeln!(f, "{prefix}└─ failed to load: {message}{hint}")
        }
        NodeBody::Children(nodes) => {
            for n in nodes {
                write_node(f, n, prefix)?;
            }
            Ok(())
        }
    }
}

fn write_node(f: &mut fmt::Formatter<'_>, n: &RenderedNode, prefix: &str) -> fmt::Result {
    let c = &n.comment;
    let connector = if n.connectors.is_last { "└─ " } else { "├─ " };
    let fold = match (&n.body, n.connectors.is_leaf) {
        (NodeBody::Hidden, false) => "▶ ",
        (NodeBody::Hidden, true) => "",
        _ => "▼ ",
    };
    write!(
        f,
        "{prefix}{connector}{fold}{}: {}",
        c.author_display_name,
        c.content.as_deref().unwrap_or("[deleted]")
    )?;
    if c.is_edited {
        write!(f, " (edited)")?;
    }
    if c.like_count > 0 {
        let mark = if c.liked_by_current_user { "♥" } else { "♡" };
        write!(f, " {mark}{}", c.like_count)?;
    }
    if n.view_replies {
        write!(f, " [view {} replies]", c.reply_count)?;
    }
    if let Some(e) = &n.error {
        write!(f, " !! {e}")?;
    }
    writeln!(f)?;

    let inner = format!("{prefix}{}", if n.connectors.is_last { "   " } else { "│  " });
    write_body(f, &n.body, &inner)?;
    if n.has_more {
        writeln!(f, "{inner}└─ … more replies")?;
    }
    if let Some(e) = &n.more_error {
        writeln!(f, "{inner}└─ failed to load more: {e}")?;
    }
    Ok(())
}

impl fmt::Display for RenderedThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.body {
            NodeBody::Hidden => writeln!(f, "(comments not loaded)")?,
            NodeBody::Empty { removed: true } => writeln!(f, "(post removed)")?,
            NodeBody::Empty { removed: false } => writeln!(f, "(no comments yet)")?,
            body => write_body(f, body, "")?,
        }
        if self.has_more {
            writeln!(f, "… more comments")?;
        }
        Ok(())
    }
}
