use async_trait::async_trait;
use reqwest::{RequestBuilder, StatusCode};

use crate::{
    api::{
        ApiResponse, Comment, CommentEdit, CommentId, Error, Gateway, LikeState, NewComment,
        Page, PageRequest, PostId,
    },
    Session,
};

/// `Gateway` speaking to the REST backend
pub struct HttpGateway {
    client: reqwest::Client,
    base: String,
    session: Session,
}

fn network_error(e: reqwest::Error) -> Error {
    Error::Network(e.to_string())
}

impl HttpGateway {
    pub fn new(base: impl Into<String>, session: Session) -> HttpGateway {
        HttpGateway {
            client: reqwest::Client::new(),
            base: base.into().trim_end_matches('/').to_string(),
            session,
        }
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    fn top_level_request(&self, post: PostId, page: PageRequest) -> RequestBuilder {
        self.client.get(self.url("/comments")).query(&[
            ("postId", post.0.to_string()),
            ("page", page.page.to_string()),
            ("pageSize", page.page_size.to_string()),
        ])
    }

    fn replies_request(&self, comment: CommentId, page: PageRequest) -> RequestBuilder {
        self.client
            .get(self.url(&format!("/comments/{}/replies", comment.0)))
            .query(&[
                ("page", page.page.to_string()),
                ("pageSize", page.page_size.to_string()),
            ])
    }

    fn create_request(&self, c: &NewComment) -> RequestBuilder {
        self.client.post(self.url("/comments")).json(c)
    }

    fn edit_request(&self, comment: CommentId, e: &CommentEdit) -> RequestBuilder {
        self.client
            .put(self.url(&format!("/comments/{}", comment.0)))
            .json(e)
    }

    fn delete_request(&self, comment: CommentId) -> RequestBuilder {
        self.client
            .delete(self.url(&format!("/comments/{}", comment.0)))
    }

    fn like_request(&self, comment: CommentId) -> RequestBuilder {
        self.client
            .post(self.url(&format!("/likes/comments/{}", comment.0)))
    }

    /// Sends the request with the session's credentials, returning the raw
    /// body of a successful response
    async fn send(&self, req: RequestBuilder) -> Result<Vec<u8>, Error> {
        let req = match self.session.token() {
            Some(token) => req.bearer_auth(token.0),
            None => req,
        };
        let resp = req.send().await.map_err(network_error)?;
        let status = resp.status();
        let body = resp.bytes().await.map_err(network_error)?;
        if status == StatusCode::UNAUTHORIZED {
            self.session.expire();
        }
        if !status.is_success() {
            let err = Error::from_response(status, &body);
            tracing::info!(%status, %err, "backend request failed");
            return Err(err);
        }
        Ok(body.to_vec())
    }

    async fn send_json<T>(&self, req: RequestBuilder) -> Result<ApiResponse<T>, Error>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let body = self.send(req).await?;
        parse_envelope(&body)
    }
}

fn parse_envelope<T>(body: &[u8]) -> Result<ApiResponse<T>, Error>
where
    T: for<'de> serde::Deserialize<'de>,
{
    serde_json::from_slice(body)
        .map_err(|e| Error::Unknown(format!("failed to parse response from server: {e}")))
}

#[async_trait]
impl Gateway for HttpGateway {
    async fn fetch_top_level(
        &self,
        post: PostId,
        page: PageRequest,
    ) -> Result<Page<Comment>, Error> {
        self.send_json::<Vec<Comment>>(self.top_level_request(post, page))
            .await?
            .into_page(page)
    }

    async fn fetch_replies(
        &self,
        _post: PostId,
        comment: CommentId,
        page: PageRequest,
    ) -> Result<Page<Comment>, Error> {
        self.send_json::<Vec<Comment>>(self.replies_request(comment, page))
            .await?
            .into_page(page)
    }

    async fn create_comment(&self, c: &NewComment) -> Result<Comment, Error> {
        c.validate()?;
        self.send_json(self.create_request(c)).await?.into_data()
    }

    async fn edit_comment(&self, comment: CommentId, e: &CommentEdit) -> Result<Comment, Error> {
        e.validate()?;
        self.send_json(self.edit_request(comment, e))
            .await?
            .into_data()
    }

    async fn delete_comment(&self, comment: CommentId) -> Result<(), Error> {
        self.send(self.delete_request(comment)).await.map(|_| ())
    }

    async fn toggle_like(&self, comment: CommentId) -> Result<LikeState, Error> {
        self.send_json(self.like_request(comment))
            .await?
            .into_data()
    }
}
