use http::StatusCode;

use crate::Outcome;

/// Decides the [Outcome] of a finished job from its result.
///
/// Implemented for any `Fn(&Result<T, E>) -> Outcome`.
pub trait Classifier<T, E>: Send + Sync {
    /// The outcome of a job which finished with `result`.
    fn classify(&self, result: &Result<T, E>) -> Outcome;
}

impl<F, T, E> Classifier<T, E> for F
where
    F: Fn(&Result<T, E>) -> Outcome + Send + Sync,
{
    fn classify(&self, result: &Result<T, E>) -> Outcome {
        self(result)
    }
}

/// A response with an HTTP status code.
pub trait HasStatus {
    /// The response's status code.
    fn status(&self) -> StatusCode;
}

impl<B> HasStatus for http::Response<B> {
    fn status(&self) -> StatusCode {
        http::Response::status(self)
    }
}

/// Classifies responses by status code.
///
/// - 2xx: [Outcome::Success]
/// - overload statuses (by default only 503 Service Unavailable): [Outcome::Dropped]
/// - anything else, and any error: [Outcome::Ignore]
#[derive(Debug, Clone)]
pub struct StatusClassifier {
    overload: Vec<StatusCode>,
}

impl StatusClassifier {
    /// Also treat `status` as a sign of overload, e.g. 429 Too Many Requests.
    pub fn with_overload_status(mut self, status: StatusCode) -> Self {
        if !self.overload.contains(&status) {
            self.overload.push(status);
        }
        self
    }

    /// Classify a status code.
    pub fn classify_status(&self, status: StatusCode) -> Outcome {
        if status.is_success() {
            Outcome::Success
        } else if self.overload.contains(&status) {
            Outcome::Dropped
        } else {
            Outcome::Ignore
        }
    }
}

impl Default for StatusClassifier {
    fn default() -> Self {
        Self {
            overload: vec![StatusCode::SERVICE_UNAVAILABLE],
        }
    }
}

impl<T, E> Classifier<T, E> for StatusClassifier
where
    T: HasStatus,
{
    fn classify(&self, result: &Result<T, E>) -> Outcome {
        match result {
            Ok(response) => self.classify_status(response.status()),
            Err(_) => Outcome::Ignore,
        }
    }
}
