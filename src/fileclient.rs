//! Synchronous client of the worker-to-worker file protocol.
//!
//! Two modes: `stat` learns a file's size and mtime without transferring any
//! content; `open` additionally streams the file body. The client is a
//! blocking primitive: cancellation of a containing request is observed by
//! the caller between record reads, never inside one.

use std::io::{BufReader, Read, Write};
use std::net::TcpStream;

use tracing::debug;

use crate::error::{Error, Result};
use crate::fileproto::{self, FRAME_HEADER_SIZE, FrameHeader};
use zerocopy::FromBytes;

pub struct FileClient {
    stream: BufReader<TcpStream>,
    database: String,
    file: String,
    read_content: bool,
    size: u64,
    mtime: u64,
    eof: bool,
}

impl FileClient {
    /// Open a file on a remote worker in the no-content mode.
    /// Returns `Ok(None)` when the server reports the file as unavailable.
    pub fn stat(host: &str, port: u16, database: &str, file: &str) -> Result<Option<Self>> {
        Self::connect(host, port, database, file, false)
    }

    /// Open a file on a remote worker for reading its content.
    /// Returns `Ok(None)` when the server reports the file as unavailable.
    pub fn open(host: &str, port: u16, database: &str, file: &str) -> Result<Option<Self>> {
        Self::connect(host, port, database, file, true)
    }

    fn connect(
        host: &str,
        port: u16,
        database: &str,
        file: &str,
        read_content: bool,
    ) -> Result<Option<Self>> {
        debug!(host, port, database, file, read_content, "opening remote file");

        let stream = TcpStream::connect((host, port))?;
        stream.set_nodelay(true)?;
        let mut stream = BufReader::new(stream);

        stream
            .get_mut()
            .write_all(&fileproto::encode_request(database, file, read_content))?;
        stream.get_mut().flush()?;

        let mut header = [0_u8; FRAME_HEADER_SIZE];
        stream.read_exact(&mut header)?;
        let length = FrameHeader::read_from_bytes(&header)
            .map_err(|_| Error::FileServer("bad response frame header".to_string()))?
            .length
            .get() as usize;
        let mut body = vec![0_u8; length];
        stream.read_exact(&mut body)?;
        let response = fileproto::decode_response(&body)?;

        if !response.available {
            debug!(database, file, "remote file is not available");
            return Ok(None);
        }
        Ok(Some(Self {
            stream,
            database: database.to_string(),
            file: file.to_string(),
            read_content,
            size: response.size,
            mtime: response.mtime,
            eof: false,
        }))
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn file(&self) -> &str {
        &self.file
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// Modification time at the source, seconds since the UNIX epoch.
    pub fn mtime(&self) -> u64 {
        self.mtime
    }

    /// Read up to `buf.len()` bytes of the file body.
    ///
    /// The call blocks until the buffer is full or the server closes the
    /// stream. The first observed end-of-stream latches: all later calls
    /// return 0 without touching the socket.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.read_content {
            return Err(Error::InvalidParam(format!(
                "file '{}' of database '{}' was opened in the stat mode",
                self.file, self.database
            )));
        }
        if buf.is_empty() {
            return Err(Error::InvalidParam("zero-size buffer".to_string()));
        }
        if self.eof {
            return Ok(0);
        }
        let mut total = 0;
        while total < buf.len() {
            match self.stream.read(&mut buf[total..]) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => total += n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.eof = true;
                    break;
                }
                Err(e) => {
                    return Err(Error::FileServer(format!(
                        "failed to receive a data record for file '{}' of database '{}': {e}",
                        self.file, self.database
                    )));
                }
            }
        }
        Ok(total)
    }
}
