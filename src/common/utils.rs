//! Utility functions for minireg

/// BLAKE3 hex digest of a schema's text
pub fn fingerprint(schema: &str) -> String {
    blake3::hash(schema.as_bytes()).to_hex().to_string()
}

/// Retry with exponential backoff and jitter
pub async fn retry_with_backoff<F, Fut, T>(
    mut f: F,
    max_retries: usize,
    initial_delay: std::time::Duration,
) -> crate::Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = crate::Result<T>>,
{
    let mut delay = initial_delay;

    for attempt in 0..max_retries {
        match f().await {
            Ok(result) => return Ok(result),
            Err(e) if e.is_retryable() && attempt < max_retries - 1 => {
                let jitter = std::time::Duration::from_millis(rand::random::<u64>() % 25);
                tracing::warn!(
                    "Retry attempt {} failed: {}, retrying in {:?}",
                    attempt + 1,
                    e,
                    delay + jitter
                );
                tokio::time::sleep(delay + jitter).await;
                delay *= 2;
            }
            Err(e) => return Err(e),
        }
    }

    Err(crate::Error::Internal("Max retries exceeded".into()))
}

/// Validate a subject name (non-empty, no control characters)
pub fn validate_subject(subject: &str) -> crate::Result<()> {
    if subject.is_empty() {
        return Err(crate::Error::InvalidInput("subject cannot be empty".into()));
    }

    if subject.len() > 1024 {
        return Err(crate::Error::InvalidInput(
            "subject too long (max 1024 bytes)".into(),
        ));
    }

    if subject.chars().any(|c| c.is_control()) {
        return Err(crate::Error::InvalidInput(
            "subject contains invalid characters".into(),
        ));
    }

    Ok(())
}
