use uuid::Uuid;

tokio::task_local! {
    static CORRELATION_ID: String;
}

/// Runs `f` with the given correlation id visible to everything on this task.
pub async fn scope<F>(id: String, f: F) -> F::Output
where
    F: std::future::Future,
{
    CORRELATION_ID.scope(id, f).await
}

/// The correlation id of the request currently being served, if any.
pub fn current() -> Option<String> {
    CORRELATION_ID.try_with(|id| id.clone()).ok()
}

pub fn new_correlation_id() -> String {
    Uuid::new_v4().to_string()
}
