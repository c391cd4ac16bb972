use bytes::BytesMut;

/// Conceptually, this iterator appends the given byte slice to the current line buffer, which may
/// already hold some previously read data.
/// The resulting view of data is split by newlines (`\n`). Every completed line is yielded, with
/// a trailing `\r` removed, so both `\n` and `\r\n` terminated output decodes to the same lines.
/// The remainder of the chunk, not completed with a newline character, becomes the new content
/// of `line_buffer`.
///
/// Bytes are only decoded once a line is complete. A multi-byte UTF-8 character split across two
/// chunks therefore survives, while truly invalid sequences are replaced lossily.
pub(crate) struct LineReader<'c, 'b> {
    chunk: &'c [u8],
    line_buffer: &'b mut BytesMut,
}

impl<'c, 'b> LineReader<'c, 'b> {
    pub(crate) fn new(chunk: &'c [u8], line_buffer: &'b mut BytesMut) -> Self {
        Self { chunk, line_buffer }
    }
}

impl Iterator for LineReader<'_, '_> {
    type Item = String;

    fn next(&mut self) -> Option<Self::Item> {
        if self.chunk.is_empty() {
            return None;
        }

        match self.chunk.iter().position(|b| *b == b'\n') {
            None => {
                // No more line breaks - keep the remaining chunk for later.
                self.line_buffer.extend_from_slice(self.chunk);
                self.chunk = &[];
                None
            }
            Some(pos) => {
                self.line_buffer.extend_from_slice(&self.chunk[..pos]);
                self.chunk = &self.chunk[pos + 1..];
                let line = self.line_buffer.split();
                Some(decode_line(&line))
            }
        }
    }
}

/// Decodes one line worth of bytes, dropping a trailing carriage return.
pub(crate) fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
