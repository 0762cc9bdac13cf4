#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("read from {source_name} failed: {error}")]
    Read {
        source_name: &'static str,
        #[source]
        error: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn read_error_names_source_and_keeps_cause() {
        let err = IngestError::Read {
            source_name: "secondary",
            error: std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"),
        };
        assert_eq!(err.to_string(), "read from secondary failed: pipe closed");
        assert_eq!(err.source().unwrap().to_string(), "pipe closed");
    }
}
