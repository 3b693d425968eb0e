//! Streaming token pipeline
//!
//! The model runtime calls [`TokenSink::on_fragment`] once per generated
//! fragment, in order. [`ResponseStreamer`] trims and accumulates the
//! fragments, checks the stop patterns against everything generated so far,
//! and writes through to a [`FragmentWriter`]. Returning `false` tells the
//! runtime to stop generating.

use axum::body::Bytes;
use regex::Regex;
use tokio::sync::mpsc::UnboundedSender;

use crate::conversation::trim_and_append;

/// Receives generated fragments from a model runtime
pub trait TokenSink {
    /// Handle one fragment. Returns `false` to halt generation.
    fn on_fragment(&mut self, fragment: &str) -> bool;
}

/// The write failed because the reader went away
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("response sink closed")]
pub struct SinkClosed;

/// Destination for response fragments
pub trait FragmentWriter {
    fn write_fragment(&mut self, fragment: &str) -> Result<(), SinkClosed>;
}

/// A chunk of an HTTP response body
pub type BodyChunk = Result<Bytes, std::io::Error>;

impl FragmentWriter for UnboundedSender<BodyChunk> {
    fn write_fragment(&mut self, fragment: &str) -> Result<(), SinkClosed> {
        self.send(Ok(Bytes::copy_from_slice(fragment.as_bytes())))
            .map_err(|_| SinkClosed)
    }
}

impl FragmentWriter for UnboundedSender<String> {
    fn write_fragment(&mut self, fragment: &str) -> Result<(), SinkClosed> {
        self.send(fragment.to_string()).map_err(|_| SinkClosed)
    }
}

impl FragmentWriter for String {
    fn write_fragment(&mut self, fragment: &str) -> Result<(), SinkClosed> {
        self.push_str(fragment);
        Ok(())
    }
}

/// Why a response ended before the runtime finished on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// The server-wide stop pattern matched
    ServerPattern,
    /// The caller's stop pattern matched
    RequestPattern,
    /// Writing to the sink failed, usually a client disconnect
    SinkClosed,
}

#[derive(Debug)]
pub struct ResponseStreamer<W> {
    accumulated: String,
    server_stop: Option<Regex>,
    request_stop: Option<Regex>,
    writer: W,
    stopped: Option<StopReason>,
}

impl<W: FragmentWriter> ResponseStreamer<W> {
    pub fn new(writer: W) -> Self {
        Self {
            accumulated: String::new(),
            server_stop: None,
            request_stop: None,
            writer,
            stopped: None,
        }
    }

    pub fn with_stop_patterns(mut self, server: Option<Regex>, request: Option<Regex>) -> Self {
        self.server_stop = server;
        self.request_stop = request;
        self
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        self.stopped
    }

    pub fn into_parts(self) -> (String, W) {
        (self.accumulated, self.writer)
    }

    // The whole response is rescanned on every fragment.
    fn matched_stop(&self) -> Option<StopReason> {
        if matches!(&self.server_stop, Some(re) if re.is_match(&self.accumulated)) {
            return Some(StopReason::ServerPattern);
        }
        if matches!(&self.request_stop, Some(re) if re.is_match(&self.accumulated)) {
            return Some(StopReason::RequestPattern);
        }
        None
    }
}

impl<W: FragmentWriter> TokenSink for ResponseStreamer<W> {
    fn on_fragment(&mut self, token: &str) -> bool {
        if self.stopped.is_some() {
            return false;
        }

        let fragment = trim_and_append(&mut self.accumulated, token);

        if let Some(reason) = self.matched_stop() {
            tracing::debug!(?reason, "stop pattern matched");
            self.stopped = Some(reason);
            return false;
        }

        if fragment.is_empty() {
            return true;
        }

        match self.writer.write_fragment(fragment) {
            Ok(()) => true,
            Err(SinkClosed) => {
                tracing::debug!("response sink closed, halting generation");
                self.stopped = Some(StopReason::SinkClosed);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    /// Accepts a fixed number of writes, then reports the sink as closed
    struct ClosingWriter {
        written: Vec<String>,
        capacity: usize,
    }

    impl FragmentWriter for ClosingWriter {
        fn write_fragment(&mut self, fragment: &str) -> Result<(), SinkClosed> {
            if self.written.len() == self.capacity {
                return Err(SinkClosed);
            }
            self.written.push(fragment.to_string());
            Ok(())
        }
    }

    fn drive<W: FragmentWriter>(streamer: &mut ResponseStreamer<W>, fragments: &[&str]) -> usize {
        let mut delivered = 0;
        for fragment in fragments {
            delivered += 1;
            if !streamer.on_fragment(fragment) {
                break;
            }
        }
        delivered
    }

    #[test]
    fn test_leading_whitespace_is_trimmed() {
        let mut streamer = ResponseStreamer::new(String::new());
        let delivered = drive(&mut streamer, &["  ", "\n", "  Hello", " world", "\n"]);

        assert_eq!(delivered, 5);
        assert_eq!(streamer.stop_reason(), None);
        let (response, written) = streamer.into_parts();
        assert_eq!(response, "Hello world\n");
        assert_eq!(response, written);
    }

    #[test]
    fn test_server_pattern_stops_before_writing() {
        let server = Regex::new("User:").unwrap();
        let mut streamer = ResponseStreamer::new(String::new()).with_stop_patterns(Some(server), None);
        let delivered = drive(&mut streamer, &["Sure.", "\n", "User", ":", " more"]);

        assert_eq!(delivered, 4);
        assert_eq!(streamer.stop_reason(), Some(StopReason::ServerPattern));
        let (response, written) = streamer.into_parts();
        assert_eq!(response, "Sure.\nUser:");
        assert_eq!(written, "Sure.\nUser");
    }

    #[test]
    fn test_request_pattern_stops() {
        let request = Regex::new(r"\d{3}").unwrap();
        let mut streamer =
            ResponseStreamer::new(String::new()).with_stop_patterns(None, Some(request));
        drive(&mut streamer, &["a1", "2", "3", "b"]);

        assert_eq!(streamer.stop_reason(), Some(StopReason::RequestPattern));
        assert_eq!(streamer.into_parts().1, "a12");
    }

    #[test]
    fn test_server_pattern_is_checked_first() {
        let server = Regex::new("END").unwrap();
        let request = Regex::new("E").unwrap();
        let mut streamer = ResponseStreamer::new(String::new())
            .with_stop_patterns(Some(server), Some(request));

        // only the request pattern matches here
        assert!(!streamer.on_fragment("E"));
        assert_eq!(streamer.stop_reason(), Some(StopReason::RequestPattern));

        let server = Regex::new("END").unwrap();
        let request = Regex::new("N").unwrap();
        let mut streamer = ResponseStreamer::new(String::new())
            .with_stop_patterns(Some(server), Some(request));
        assert!(!streamer.on_fragment("END"));
        assert_eq!(streamer.stop_reason(), Some(StopReason::ServerPattern));
        assert_eq!(streamer.into_parts().1, "");
    }

    #[test]
    fn test_write_failure_halts() {
        let writer = ClosingWriter {
            written: Vec::new(),
            capacity: 2,
        };
        let mut streamer = ResponseStreamer::new(writer);
        let delivered = drive(&mut streamer, &["a", "b", "c", "d"]);

        assert_eq!(delivered, 3);
        assert_eq!(streamer.stop_reason(), Some(StopReason::SinkClosed));
        // later fragments are refused without another write attempt
        assert!(!streamer.on_fragment("e"));
        let (_, writer) = streamer.into_parts();
        assert_eq!(writer.written, vec!["a", "b"]);
    }

    #[test]
    fn test_empty_fragments_are_not_written() {
        let writer = ClosingWriter {
            written: Vec::new(),
            capacity: 0,
        };
        let mut streamer = ResponseStreamer::new(writer);
        assert!(streamer.on_fragment("   "));
        assert!(!streamer.on_fragment("x"));
    }

    #[tokio::test]
    async fn test_channel_delivery() {
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        let mut streamer = ResponseStreamer::new(tx);
        drive(&mut streamer, &[" one", " two"]);
        drop(streamer);

        let mut received = Vec::new();
        while let Some(fragment) = rx.recv().await {
            received.push(fragment);
        }
        assert_eq!(received, vec!["one", " two"]);
    }

    #[test]
    fn test_dropped_receiver_halts() {
        let (tx, rx) = mpsc::unbounded_channel::<BodyChunk>();
        let mut streamer = ResponseStreamer::new(tx);
        assert!(streamer.on_fragment("a"));
        drop(rx);
        assert!(!streamer.on_fragment("b"));
        assert_eq!(streamer.stop_reason(), Some(StopReason::SinkClosed));
    }
}
