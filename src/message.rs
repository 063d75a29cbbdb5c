//! streaming reader over one reassembled inbound message (§4.5)

use std::io::{self, Read};

use crate::errors::WsError;

/// pulls the next CONTINUATION frame for the message currently being read
///
/// implemented by the connection's reader loop; returns the frame's
/// unmasked payload and whether it carried FIN. the connection is
/// responsible for validating frame-level invariants (I1)-(I3) and the
/// aggregate `maxMessageLength` cap before handing bytes here — by the time
/// this is called, `MessageReader` just needs bytes and an end-of-message
/// signal.
pub(crate) trait ContinuationSource {
    fn next_continuation(&mut self) -> Result<(bool, Vec<u8>), WsError>;
}

impl<F: FnMut() -> Result<(bool, Vec<u8>), WsError>> ContinuationSource for F {
    fn next_continuation(&mut self) -> Result<(bool, Vec<u8>), WsError> {
        (self)()
    }
}

/// lazy byte stream over a (possibly fragmented) inbound TEXT/BINARY message
///
/// implements [`Read`]; frame boundaries are invisible to the caller. if a
/// handler returns from `on_message` without reading to EOF, [`Drop`]
/// drains and discards whatever remains so the reader loop stays
/// synchronized with the peer.
pub struct MessageReader<'a> {
    buffer: Vec<u8>,
    pos: usize,
    fin: bool,
    source: Box<dyn ContinuationSource + 'a>,
}

impl<'a> MessageReader<'a> {
    pub(crate) fn new(
        first_payload: Vec<u8>,
        first_fin: bool,
        source: impl ContinuationSource + 'a,
    ) -> Self {
        MessageReader {
            buffer: first_payload,
            pos: 0,
            fin: first_fin,
            source: Box::new(source),
        }
    }

    fn exhausted(&self) -> bool {
        self.pos >= self.buffer.len()
    }

    fn pull_next(&mut self) -> io::Result<()> {
        let (fin, payload) = self
            .source
            .next_continuation()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        self.buffer = payload;
        self.pos = 0;
        self.fin = fin;
        Ok(())
    }
}

impl<'a> Read for MessageReader<'a> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            if !self.exhausted() {
                let available = &self.buffer[self.pos..];
                let n = available.len().min(buf.len());
                buf[..n].copy_from_slice(&available[..n]);
                self.pos += n;
                return Ok(n);
            }
            if self.fin {
                return Ok(0);
            }
            self.pull_next()?;
        }
    }
}

impl<'a> Drop for MessageReader<'a> {
    fn drop(&mut self) {
        let mut scratch = [0u8; 4096];
        loop {
            match self.read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
    }
}
