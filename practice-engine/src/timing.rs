use tokio::time::{sleep_until, Instant};

/// Sleep until `deadline`, or forever when there is none. Meant as one arm
/// of a `select!`.
pub(crate) async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending::<()>().await,
    }
}
