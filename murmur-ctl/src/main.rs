use std::{path::PathBuf, time::Instant};

use anyhow::{anyhow, bail, Context};
use murmur_api::{Author, CommentId, IdempotencyToken, PostId, PostService};
use murmur_client::{
    fetch_snapshot, perform, CommentTree, CommentView, Config, HttpPostService, NodeId, Notice,
    Session, UserAction,
};

#[derive(structopt::StructOpt)]
struct Opt {
    #[structopt(short, long)]
    host: String,

    /// Bearer token for the post service, leave unset to browse signed out
    #[structopt(long, env = "MURMUR_TOKEN", hide_env_values = true)]
    token: Option<String>,

    /// Handle the token belongs to
    #[structopt(long, default_value = "")]
    handle: String,

    /// JSON configuration file
    #[structopt(short, long, parse(from_os_str))]
    config: Option<PathBuf>,

    #[structopt(subcommand)]
    cmd: Command,
}

#[derive(structopt::StructOpt)]
enum Command {
    /// Show the comments of a post
    Show { post: i64 },

    /// Comment on a post
    Comment { post: i64, content: String },

    /// Reply to a comment. Replies to comments nested too deep get threaded back.
    Reply {
        post: i64,
        comment: i64,
        content: String,
    },

    /// Edit one of your comments
    Edit { comment: i64, content: String },

    /// Delete one of your comments
    Delete { comment: i64 },

    /// Like a comment, or unlike it if already liked
    Like { comment: i64 },
}

fn session(token: Option<String>, handle: String) -> Session {
    match token {
        None => Session::anonymous(),
        Some(token) => Session::new(
            Author {
                display_name: handle.clone(),
                handle,
                avatar_url: None,
            },
            token,
        ),
    }
}

async fn load(
    service: &HttpPostService,
    post: PostId,
    session: Session,
    config: Config,
) -> anyhow::Result<CommentView> {
    let snapshot = fetch_snapshot(service, post, &config)
        .await
        .with_context(|| format!("loading comments of post {post}"))?;
    let mut view = CommentView::init(post, session, config);
    view.resync(snapshot, Instant::now());
    Ok(view)
}

/// Apply `action` and send everything it needs, failing on the first error
async fn submit(
    view: &mut CommentView,
    service: &HttpPostService,
    action: UserAction,
) -> anyhow::Result<()> {
    view.submit(action).context("preparing comment")?;
    for req in view.take_ready() {
        let (post, token) = (req.post, req.token);
        let res = perform(service, req).await;
        view.on_reply(post, token, res);
    }
    for notice in view.take_notices() {
        match notice {
            Notice::SignInRequired => bail!("signing in is required, set MURMUR_TOKEN"),
            Notice::Toast { message, .. } => bail!("post service refused the comment: {message}"),
            _ => (),
        }
    }
    Ok(())
}

fn render(t: &CommentTree, session: &Session) {
    let c = &t.comment;
    let author = c.display_author();
    let mut header = format!("{:indent$}#{} {}", "", c.id, author.display_name, indent = 2 * t.depth);
    if !c.deleted {
        header.push_str(&format!(" (@{})", author.handle));
        if session.owns(&c.author) {
            header.push_str(" [you]");
        }
    }
    if c.like_count > 0 {
        header.push_str(&format!(", {} likes", c.like_count));
    }
    println!("{header}");
    println!("{:indent$}{}", "", c.content, indent = 2 * t.depth + 2);
    for r in &t.replies {
        render(r, session);
    }
}

fn show(view: &CommentView) {
    let count = view.count();
    println!(
        "post {}: {} comments ({} deleted)",
        view.post(),
        count.visible,
        count.total - count.visible
    );
    for t in view.tree() {
        render(&t, view.session());
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let opt = <Opt as structopt::StructOpt>::from_args();

    let config = match &opt.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    if opt.token.is_some() && opt.handle.is_empty() {
        tracing::warn!("no --handle given, own comments will not be recognized");
    }
    let session = session(opt.token, opt.handle);
    let service = HttpPostService::new(&opt.host, &session, &config);

    match opt.cmd {
        Command::Show { post } => {
            let view = load(&service, PostId(post), session, config).await?;
            show(&view);
        }
        Command::Comment { post, content } => {
            let mut view = load(&service, PostId(post), session, config).await?;
            submit(&mut view, &service, UserAction::Comment { content }).await?;
            show(&view);
        }
        Command::Reply {
            post,
            comment,
            content,
        } => {
            let mut view = load(&service, PostId(post), session, config).await?;
            let target = view
                .store()
                .key_of(&NodeId::Canonical(CommentId(comment)))
                .ok_or_else(|| anyhow!("comment {comment} is not on post {post}"))?;
            submit(&mut view, &service, UserAction::Reply { target, content }).await?;
            show(&view);
        }
        Command::Edit { comment, content } => {
            let c = service
                .update_comment(CommentId(comment), content, IdempotencyToken::new())
                .await
                .with_context(|| format!("editing comment {comment}"))?;
            println!("edited comment {} on post {}", c.id, c.post_id);
        }
        Command::Delete { comment } => {
            service
                .delete_comment(CommentId(comment), IdempotencyToken::new())
                .await
                .with_context(|| format!("deleting comment {comment}"))?;
            println!("deleted comment {comment}");
        }
        Command::Like { comment } => {
            let status = service
                .toggle_like(CommentId(comment))
                .await
                .with_context(|| format!("toggling like on comment {comment}"))?;
            let verb = if status.liked { "liked" } else { "unliked" };
            println!("{verb} comment {comment}, {} likes", status.like_count);
        }
    }

    Ok(())
}
