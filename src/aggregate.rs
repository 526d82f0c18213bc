use std::fmt;

use crate::{Error, Result};

/// Errors collected while walking a multi-step operation.
///
/// Each entry keeps the labels that locate it (feature, cluster, object...).
/// An aggregate lives for one reconcile call: create it on entry, push
/// failures as they happen and turn it into a single result on exit.
#[derive(Debug, Default)]
pub struct ErrorAggregate {
    errors: Vec<(Error, Vec<String>)>,
}

impl ErrorAggregate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push<I, S>(&mut self, error: Error, labels: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.errors
            .push((error, labels.into_iter().map(Into::into).collect()));
    }

    /// Record the error of `result` (if any) and hand back the success value
    pub fn collect<T, I, S>(&mut self, result: Result<T>, labels: I) -> Option<T>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                self.push(e, labels);
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> impl Iterator<Item = (&Error, &[String])> {
        self.errors.iter().map(|(e, l)| (e, l.as_slice()))
    }

    /// Consume the aggregate: `Ok(())` when nothing failed, one joined error otherwise
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Aggregate(self))
        }
    }
}

impl fmt::Display for ErrorAggregate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s) occurred:", self.errors.len())?;
        for (error, labels) in &self.errors {
            if labels.is_empty() {
                write!(f, "\n\t* {error}")?;
            } else {
                write!(f, "\n\t* [{}] {error}", labels.join("/"))?;
            }
        }
        Ok(())
    }
}
