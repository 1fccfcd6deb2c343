use crate::core::Status;

/// Accumulates the records of one probe run; the overall status is the most severe one seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Findings {
    status: Option<Status>,
    summary: String,
}

impl Findings {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, status: Status, text: impl AsRef<str>) {
        if self.status.is_none_or(|current| status >= current) {
            self.status = Some(status);
            self.summary = format!("{status}: {}", text.as_ref());
        }
    }

    pub fn status(&self) -> Option<Status> {
        self.status
    }

    /// Text of the highest-severity finding (the latest one on ties).
    pub fn summary(&self) -> &str {
        &self.summary
    }
}
