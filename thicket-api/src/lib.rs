use async_trait::async_trait;
use chrono::Utc;

pub use uuid::{uuid, Uuid};
pub type Time = chrono::DateTime<Utc>;

mod error;
pub use error::Error;

pub const STUB_UUID: Uuid = uuid!("ffffffff-ffff-ffff-ffff-ffffffffffff");

/// Page size used when the caller does not ask for another one
pub const DEFAULT_PAGE_SIZE: u32 = 25;

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct PostId(pub Uuid);

impl PostId {
    pub fn stub() -> PostId {
        PostId(STUB_UUID)
    }
}

#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize,
)]
pub struct CommentId(pub Uuid);

impl CommentId {
    pub fn stub() -> CommentId {
        CommentId(STUB_UUID)
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct UserId(pub Uuid);

impl UserId {
    pub fn stub() -> UserId {
        UserId(STUB_UUID)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct AuthToken(pub String);

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
    pub id: CommentId,
    pub post_id: PostId,

    /// `None` when the comment was deleted or redacted, which is not the
    /// same thing as an empty comment
    pub content: Option<String>,

    pub created_at: Time,
    #[serde(default)]
    pub updated_at: Option<Time>,
    #[serde(default)]
    pub is_edited: bool,

    pub author_id: UserId,
    pub author_display_name: String,
    pub author_avatar_ref: Option<String>,

    pub like_count: u64,
    pub liked_by_current_user: bool,

    /// Number of replies according to the server, regardless of how many
    /// are loaded locally
    pub reply_count: u64,

    pub parent_comment_id: Option<CommentId>,
}

impl Comment {
    pub fn is_top_level(&self) -> bool {
        self.parent_comment_id.is_none()
    }

    pub fn is_redacted(&self) -> bool {
        self.content.is_none()
    }

    pub fn is_leaf(&self) -> bool {
        self.reply_count == 0
    }

    pub fn like_state(&self) -> LikeState {
        LikeState {
            liked_by_current_user: self.liked_by_current_user,
            like_count: self.like_count,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    /// 1-indexed
    pub page: u32,
    pub page_size: u32,
}

impl PageRequest {
    pub fn first(page_size: u32) -> PageRequest {
        PageRequest { page: 1, page_size }
    }

    pub fn nth(page: u32, page_size: u32) -> PageRequest {
        PageRequest { page, page_size }
    }

    pub fn next(&self) -> PageRequest {
        PageRequest {
            page: self.page + 1,
            page_size: self.page_size,
        }
    }
}

impl Default for PageRequest {
    fn default() -> PageRequest {
        PageRequest::first(DEFAULT_PAGE_SIZE)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginationMeta {
    pub page_number: u32,
    pub page_size: u32,
    pub total_pages: u32,
    pub total_items: u64,
}

impl PaginationMeta {
    /// Metadata for a collection that fits in the given page
    pub fn single(req: PageRequest, total_items: u64) -> PaginationMeta {
        let size = u64::from(req.page_size.max(1));
        PaginationMeta {
            page_number: req.page,
            page_size: req.page_size,
            total_pages: ((total_items + size - 1) / size) as u32,
            total_items,
        }
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub meta: PaginationMeta,
}

impl<T> Page<T> {
    pub fn has_more(&self) -> bool {
        self.meta.page_number < self.meta.total_pages
    }
}

/// Envelope wrapping every backend response body
#[derive(Clone, Debug, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiResponse<T> {
    pub success: bool,
    pub message: Option<String>,
    pub data: Option<T>,
    pub errors: Option<Vec<String>>,
    pub status_code: u16,
    pub meta: Option<PaginationMeta>,
    pub error_code: Option<String>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T, meta: Option<PaginationMeta>) -> ApiResponse<T> {
        ApiResponse {
            success: true,
            message: None,
            data: Some(data),
            errors: None,
            status_code: 200,
            meta,
            error_code: None,
        }
    }

    pub fn into_data(self) -> Result<T, Error> {
        if !self.success {
            return Err(Error::Unknown(
                self.message
                    .unwrap_or_else(|| String::from("request reported failure")),
            ));
        }
        self.data
            .ok_or_else(|| Error::Unknown(String::from("response envelope carries no data")))
    }
}

impl<T> ApiResponse<Vec<T>> {
    /// Pagination metadata is optional on the wire, a missing one means
    /// the whole collection fit in the requested page
    pub fn into_page(self, req: PageRequest) -> Result<Page<T>, Error> {
        let meta = self.meta;
        let items = self.into_data()?;
        let meta = meta.unwrap_or_else(|| PaginationMeta::single(req, items.len() as u64));
        Ok(Page { items, meta })
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewComment {
    pub post_id: PostId,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_comment_id: Option<CommentId>,
}

impl NewComment {
    pub fn validate(&self) -> Result<(), Error> {
        validate_content(&self.content)
    }
}

#[derive(Clone, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
pub struct CommentEdit {
    pub content: String,
}

impl CommentEdit {
    pub fn validate(&self) -> Result<(), Error> {
        validate_content(&self.content)
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LikeState {
    pub liked_by_current_user: bool,
    pub like_count: u64,
}

pub fn validate_content(content: &str) -> Result<(), Error> {
    if content.trim().is_empty() {
        return Err(Error::Validation(String::from(
            "comment content must not be empty",
        )));
    }
    if content.contains('\0') {
        return Err(Error::Validation(String::from(
            "null byte in comment content is not allowed",
        )));
    }
    Ok(())
}

/// Backend contract the comment tree is synchronized against
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn fetch_top_level(&self, post: PostId, page: PageRequest)
        -> Result<Page<Comment>, Error>;

    async fn fetch_replies(
        &self,
        post: PostId,
        comment: CommentId,
        page: PageRequest,
    ) -> Result<Page<Comment>, Error>;

    async fn create_comment(&self, c: &NewComment) -> Result<Comment, Error>;

    async fn edit_comment(&self, comment: CommentId, e: &CommentEdit) -> Result<Comment, Error>;

    async fn delete_comment(&self, comment: CommentId) -> Result<(), Error>;

    /// Toggle semantics: calling twice flips the like on then off
    async fn toggle_like(&self, comment: CommentId) -> Result<LikeState, Error>;
}
