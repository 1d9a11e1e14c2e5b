//! Line-oriented decoding of container log streams.
//!
//! Pod log and attach streams arrive as arbitrary byte chunks; the scanner
//! reassembles them into lines and hands each line to a callback. EOF is a
//! normal termination, a trailing fragment without a newline is still
//! delivered, and pathological lines are truncated rather than buffered
//! without bound.

use futures::{io::AsyncBufRead, AsyncBufReadExt};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The maximum number of bytes buffered for a single line. Bytes beyond this
/// are discarded and the delivered line ends with [`TRUNCATION_MARKER`].
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Appended to a delivered line whose tail was discarded.
pub const TRUNCATION_MARKER: &[u8] = b"...(line truncated)";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Reads the stream to EOF, invoking `callback` once per line.
///
/// Lines are terminated by `\n`; the terminator and a trailing `\r` are not
/// part of the delivered bytes. The fragment after the last newline, if any,
/// is delivered as a final line when the stream ends.
pub async fn scan_reader<R, F>(mut reader: R, mut callback: F) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
    F: FnMut(&[u8]),
{
    let mut line: Vec<u8> = Vec::new();
    let mut truncated = false;

    loop {
        let (consumed, complete) = {
            let chunk = reader.fill_buf().await?;
            if chunk.is_empty() {
                break;
            }
            match chunk.iter().position(|&b| b == b'\n') {
                Some(at) => {
                    push_bounded(&mut line, &mut truncated, &chunk[..at]);
                    (at + 1, true)
                }
                None => {
                    push_bounded(&mut line, &mut truncated, chunk);
                    (chunk.len(), false)
                }
            }
        };
        reader.consume_unpin(consumed);

        if complete {
            deliver(&mut line, &mut truncated, &mut callback);
        }
    }

    if !line.is_empty() || truncated {
        deliver(&mut line, &mut truncated, &mut callback);
    }

    Ok(())
}

/// Appends to the pending line, discarding anything past the line limit.
fn push_bounded(line: &mut Vec<u8>, truncated: &mut bool, chunk: &[u8]) {
    if *truncated {
        return;
    }

    let remaining = MAX_LINE_BYTES - line.len();
    if chunk.len() > remaining {
        line.extend_from_slice(&chunk[..remaining]);
        *truncated = true;
    } else {
        line.extend_from_slice(chunk);
    }
}

fn deliver<F: FnMut(&[u8])>(line: &mut Vec<u8>, truncated: &mut bool, callback: &mut F) {
    if *truncated {
        line.extend_from_slice(TRUNCATION_MARKER);
    } else if line.last() == Some(&b'\r') {
        line.pop();
    }

    callback(line);
    line.clear();
    *truncated = false;
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------
