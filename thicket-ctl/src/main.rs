use std::{io::Write, path::PathBuf, sync::Arc};

use anyhow::{anyhow, Context};
use thicket_client::{
    api::{AuthToken, CommentId, Error, PostId, Uuid},
    render, ClientConfig, CommentCache, CommentThread, FileTokenStore, HttpGateway, Session,
};

#[derive(structopt::StructOpt)]
struct Opt {
    /// Backend base url, overrides THICKET_HOST
    #[structopt(short, long)]
    host: Option<String>,

    /// Where the session token is kept
    #[structopt(long, env = "THICKET_SESSION", parse(from_os_str))]
    session: Option<PathBuf>,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Store a bearer token for later commands
    Login { token: String },

    /// Forget the stored token
    Logout,

    /// Print the comment tree of a post
    Show {
        post: Uuid,

        /// Number of levels to expand, 1 shows only top-level comments
        #[structopt(short, long, default_value = "1")]
        depth: usize,
    },

    /// Comment on a post, or reply to a comment of it
    Reply {
        post: Uuid,
        content: String,

        #[structopt(short, long)]
        parent: Option<Uuid>,
    },

    /// Replace the content of one of your comments
    Edit {
        post: Uuid,
        comment: Uuid,
        content: String,
    },

    /// Delete one of your comments along with its replies
    Delete {
        post: Uuid,
        comment: Uuid,

        /// Do not ask for confirmation
        #[structopt(short, long)]
        yes: bool,
    },

    /// Like a comment, or unlike it if already liked
    Like { post: Uuid, comment: Uuid },
}

fn session_path(opt: &Opt) -> anyhow::Result<PathBuf> {
    if let Some(p) = &opt.session {
        return Ok(p.clone());
    }
    let home = std::env::var("HOME").context(
        "retrieving HOME environment variable, pass --session or set THICKET_SESSION instead",
    )?;
    Ok(PathBuf::from(home).join(".config/thicket/session.json"))
}

fn confirm(question: &str) -> anyhow::Result<bool> {
    print!("{question} [y/N] ");
    std::io::stdout().flush()?;
    let mut answer = String::new();
    std::io::stdin()
        .read_line(&mut answer)
        .context("reading confirmation")?;
    Ok(matches!(answer.trim(), "y" | "Y" | "yes"))
}

fn explain(e: Error) -> anyhow::Error {
    match e {
        Error::Auth => anyhow!("session expired or missing, run `thicket-ctl login` first"),
        e => anyhow::Error::new(e),
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let opt = <Opt as structopt::StructOpt>::from_args();

    let mut config = ClientConfig::from_env().context("reading configuration")?;
    if let Some(host) = &opt.host {
        config.base_url = host.clone();
        config.validate()?;
    }
    let store = Arc::new(FileTokenStore::new(session_path(&opt)?));
    let session = Session::hydrate(store)?;

    let thread = |post: Uuid| {
        let gateway = Arc::new(HttpGateway::new(config.base_url.clone(), session.clone()));
        CommentThread::new(
            PostId(post),
            gateway,
            Arc::new(CommentCache::new()),
            config.clone(),
        )
    };

    match opt.cmd {
        Command::Login { token } => session.login(AuthToken(token))?,
        Command::Logout => session.logout()?,
        Command::Show { post, depth } => {
            let t = thread(post);
            t.expand_to_depth(depth.max(1)).await.map_err(explain)?;
            print!("{}", render(&t));
        }
        Command::Reply {
            post,
            content,
            parent,
        } => {
            let c = thread(post)
                .create(&content, parent.map(CommentId))
                .await
                .map_err(explain)?;
            println!("{}", c.id.0);
        }
        Command::Edit {
            post,
            comment,
            content,
        } => {
            thread(post)
                .edit(CommentId(comment), &content)
                .await
                .map_err(explain)?;
        }
        Command::Delete { post, comment, yes } => {
            if !yes && !confirm(&format!("Delete comment {comment} and all its replies?"))? {
                tracing::info!("deletion cancelled");
                return Ok(());
            }
            thread(post)
                .remove(CommentId(comment))
                .await
                .map_err(explain)?;
        }
        Command::Like { post, comment } => {
            let state = thread(post)
                .toggle_like(CommentId(comment))
                .await
                .map_err(explain)?;
            println!(
                "{} ({} likes)",
                if state.liked_by_current_user {
                    "liked"
                } else {
                    "unliked"
                },
                state.like_count
            );
        }
    }

    Ok(())
}
