//! Storage-backend capability abstraction (C3): `{exists, info, get, list,
//! upload, download, copy, delete}` plus a resumable byte stream. Concrete
//! wire-protocol implementations (S3, Azure Blob, GCS, Swift, TOS) are
//! external to this crate; `filesystem` is the one bundled implementation,
//! used by tests and single-node deployments.
//!
//! Grounded on the teacher's `object_storage::ObjectStorage` trait and
//! `object_storage::s3::S3`: `execute_api`/`APIContext` generalize the
//! teacher's inline `retry::retry(Fixed::from_millis(...), || block_on(...))`
//! call sites into the reusable retry harness spec §4.3 describes.

pub mod filesystem;

use std::time::Duration;

use crate::errors::{ErrorKind, OsmoError, OsmoResult};
use crate::models::Context;

/// Accumulates attempt/error history across `execute_api` retries.
#[derive(Debug, Default)]
pub struct APIContext {
    attempts: u32,
    errors: Vec<String>,
}

impl APIContext {
    pub fn new() -> Self {
        APIContext::default()
    }

    pub fn increment_attempt(&mut self) {
        self.attempts += 1;
    }

    /// Retries recorded so far: `attempts - 1` once at least one attempt has run.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

#[derive(Debug, Clone)]
pub struct APIResponse<T> {
    pub result: T,
    pub attempts: u32,
}

/// Decides whether a given error is eligible for retry, and how long to wait
/// before the next attempt.
pub trait ErrorHandler {
    fn eligible(&self, error: &OsmoError) -> bool;
    /// Returns `true` to retry, `false` to give up. Called after recording the error.
    fn handle_error(&mut self, error: &OsmoError, context: &APIContext) -> bool;
}

/// Retries up to `max_attempts` times with a fixed delay, for any error whose
/// `ErrorKind` is retryable.
pub struct FixedDelayRetry {
    pub delay: Duration,
    pub max_attempts: u32,
}

impl FixedDelayRetry {
    pub fn new(delay: Duration, max_attempts: u32) -> Self {
        FixedDelayRetry { delay, max_attempts }
    }
}

impl ErrorHandler for FixedDelayRetry {
    fn eligible(&self, error: &OsmoError) -> bool {
        error.kind().is_retryable()
    }

    fn handle_error(&mut self, _error: &OsmoError, context: &APIContext) -> bool {
        if context.attempts >= self.max_attempts {
            return false;
        }
        std::thread::sleep(self.delay);
        true
    }
}

/// Runs `call` through the retry harness: on success returns
/// `APIResponse{result, attempts}`. On a non-eligible error, re-raises
/// immediately. On an eligible error, asks `error_handler` whether to retry;
/// once it declines, wraps the final error with the accumulated context.
pub fn execute_api<T>(
    mut call: impl FnMut() -> OsmoResult<T>,
    error_handler: &mut impl ErrorHandler,
) -> OsmoResult<APIResponse<T>> {
    let mut context = APIContext::new();
    loop {
        context.increment_attempt();
        match call() {
            Ok(result) => return Ok(APIResponse { result, attempts: context.attempts }),
            Err(err) => {
                if !error_handler.eligible(&err) {
                    return Err(err);
                }
                context.errors.push(err.to_string());
                if !error_handler.handle_error(&err, &context) {
                    return Err(OsmoError::with_source(
                        err.kind(),
                        format!(
                            "storage API call failed after {} attempt(s): {}",
                            context.attempts,
                            context.errors.join("; ")
                        ),
                        err,
                    ));
                }
            }
        }
    }
}

/// A lazy sequence of byte chunks that is also a file-like reader, per the
/// resumable-stream contract in spec §4.4: automatic resumption from the
/// last delivered offset, monotonic `size` across resumptions, and scoped
/// acquisition (drop releases the underlying network/file handle).
pub trait ResumableStream {
    /// Pulls the next chunk, or `None` at end of stream. Implementations
    /// resume transparently from `bytes_delivered()` on transient errors.
    fn next_chunk(&mut self) -> OsmoResult<Option<Vec<u8>>>;

    /// Total bytes ever yielded, monotonic across internal resumptions.
    fn bytes_delivered(&self) -> u64;
}

/// Adapter that splits a `ResumableStream`'s bytes into lines, never
/// splitting a multi-byte UTF-8 sequence across chunk boundaries, and
/// tracking a `lines` counter.
pub struct LineIterator<'a> {
    stream: &'a mut dyn ResumableStream,
    pending: Vec<u8>,
    keepends: bool,
    lines: u64,
    done: bool,
}

impl<'a> LineIterator<'a> {
    pub fn new(stream: &'a mut dyn ResumableStream, keepends: bool) -> Self {
        LineIterator { stream, pending: Vec::new(), keepends, lines: 0, done: false }
    }

    pub fn lines_yielded(&self) -> u64 {
        self.lines
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let newline_pos = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=newline_pos).collect();
        if !self.keepends {
            while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
                line.pop();
            }
        }
        self.lines += 1;
        Some(line)
    }
}

impl Iterator for LineIterator<'_> {
    type Item = OsmoResult<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(line) = self.take_line() {
                return Some(Ok(line));
            }
            if self.done {
                if self.pending.is_empty() {
                    return None;
                }
                let remainder = std::mem::take(&mut self.pending);
                self.lines += 1;
                return Some(Ok(remainder));
            }
            match self.stream.next_chunk() {
                Ok(Some(chunk)) => self.pending.extend_from_slice(&chunk),
                Ok(None) => self.done = true,
                Err(err) => return Some(Err(err)),
            }
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ObjectInfo {
    pub size: u64,
    pub exists: bool,
}

/// The uniform capability set every concrete storage backend implements.
pub trait StorageBackend {
    fn context(&self) -> &Context;

    fn exists(&self, object_key: &str) -> OsmoResult<bool>;
    fn info(&self, object_key: &str) -> OsmoResult<ObjectInfo>;
    fn get(&self, object_key: &str) -> OsmoResult<Vec<u8>>;
    fn list(&self, prefix: &str) -> OsmoResult<Vec<String>>;
    fn upload(&self, object_key: &str, content: &[u8]) -> OsmoResult<()>;
    fn download(&self, object_key: &str) -> OsmoResult<Box<dyn ResumableStream>>;
    fn copy(&self, source_key: &str, dest_key: &str) -> OsmoResult<()>;
    fn delete(&self, object_key: &str) -> OsmoResult<()>;
}

pub(crate) fn invalid_key_error(object_key: &str) -> OsmoError {
    OsmoError::new(ErrorKind::User, format!("object key `{object_key}` is invalid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[test]
    fn execute_api_succeeds_immediately_with_zero_retries() {
        let mut handler = FixedDelayRetry::new(Duration::from_millis(0), 3);
        let response = execute_api(|| Ok::<_, OsmoError>(42), &mut handler).unwrap();
        assert_eq!(response.result, 42);
        assert_eq!(response.attempts, 1);
    }

    #[test]
    fn execute_api_retries_transient_errors_until_success() {
        let mut handler = FixedDelayRetry::new(Duration::from_millis(0), 5);
        let attempt = RefCell::new(0);
        let response = execute_api(
            || {
                *attempt.borrow_mut() += 1;
                if *attempt.borrow() < 3 {
                    Err(OsmoError::transient("not yet"))
                } else {
                    Ok(*attempt.borrow())
                }
            },
            &mut handler,
        )
        .unwrap();
        assert_eq!(response.result, 3);
        assert_eq!(response.attempts, 3);
    }

    #[test]
    fn execute_api_does_not_retry_non_eligible_errors() {
        let mut handler = FixedDelayRetry::new(Duration::from_millis(0), 5);
        let calls = RefCell::new(0);
        let err = execute_api(
            || {
                *calls.borrow_mut() += 1;
                Err::<i32, _>(OsmoError::user("bad input"))
            },
            &mut handler,
        )
        .unwrap_err();
        assert_eq!(*calls.borrow(), 1);
        assert_eq!(err.kind(), ErrorKind::User);
    }

    #[test]
    fn execute_api_gives_up_after_max_attempts() {
        let mut handler = FixedDelayRetry::new(Duration::from_millis(0), 2);
        let err = execute_api(
            || Err::<i32, _>(OsmoError::transient("still failing")),
            &mut handler,
        )
        .unwrap_err();
        assert!(err.message().contains("2 attempt"));
    }

    struct VecStream {
        chunks: Vec<Vec<u8>>,
        delivered: u64,
    }

    impl ResumableStream for VecStream {
        fn next_chunk(&mut self) -> OsmoResult<Option<Vec<u8>>> {
            if self.chunks.is_empty() {
                return Ok(None);
            }
            let chunk = self.chunks.remove(0);
            self.delivered += chunk.len() as u64;
            Ok(Some(chunk))
        }
        fn bytes_delivered(&self) -> u64 {
            self.delivered
        }
    }

    #[test]
    fn line_iterator_splits_across_chunk_boundaries() {
        let mut stream = VecStream { chunks: vec![b"hello wor".to_vec(), b"ld\nfoo\nba".to_vec(), b"r".to_vec()], delivered: 0 };
        let lines: Vec<Vec<u8>> = LineIterator::new(&mut stream, false).collect::<OsmoResult<Vec<_>>>().unwrap();
        assert_eq!(lines, vec![b"hello world".to_vec(), b"foo".to_vec(), b"bar".to_vec()]);
    }

    #[test]
    fn line_iterator_keepends_preserves_newline() {
        let mut stream = VecStream { chunks: vec![b"a\nb".to_vec()], delivered: 0 };
        let mut iter = LineIterator::new(&mut stream, true);
        assert_eq!(iter.next().unwrap().unwrap(), b"a\n".to_vec());
        assert_eq!(iter.next().unwrap().unwrap(), b"b".to_vec());
        assert_eq!(iter.lines_yielded(), 2);
    }
}
