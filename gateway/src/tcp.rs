//! Web server transport over std sockets. lwIP provides the same API on ESP-IDF.

use std::{
    collections::VecDeque,
    io::{ErrorKind, Read, Write},
    net::{Ipv4Addr, Shutdown, TcpListener, TcpStream},
};

use log::{debug, info, warn};
use opta2iot_common::{
    hal::{WebConnection, WebListener},
    web::TransportError,
    NetworkMode,
};

const READ_CHUNK_BYTES: usize = 512;

#[derive(Default)]
pub struct TcpWebListener {
    listener: Option<TcpListener>,
}

impl WebListener for TcpWebListener {
    type Connection = TcpConnection;

    fn begin(&mut self, port: u16, mode: NetworkMode) -> Result<(), TransportError> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .map_err(|err| TransportError::Listen(format!("port {port}: {err}")))?;
        listener.set_nonblocking(true)?;
        info!("web server listening on port {port} ({})", mode.as_str());
        self.listener = Some(listener);
        Ok(())
    }

    fn accept(&mut self) -> Option<TcpConnection> {
        match self.listener.as_ref()?.accept() {
            Ok((stream, peer)) => {
                debug!("web client {peer}");
                match TcpConnection::new(stream) {
                    Ok(conn) => Some(conn),
                    Err(err) => {
                        warn!("web client dropped: {err}");
                        None
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => None,
            Err(err) => {
                warn!("accept failed: {err}");
                None
            }
        }
    }
}

pub struct TcpConnection {
    stream: TcpStream,
    pending: VecDeque<u8>,
    open: bool,
}

impl TcpConnection {
    fn new(stream: TcpStream) -> std::io::Result<Self> {
        stream.set_nonblocking(true)?;
        Ok(Self {
            stream,
            pending: VecDeque::new(),
            open: true,
        })
    }

    fn fill(&mut self) {
        let mut chunk = [0_u8; READ_CHUNK_BYTES];
        match self.stream.read(&mut chunk) {
            Ok(0) => self.open = false,
            Ok(read) => self.pending.extend(&chunk[..read]),
            Err(err) if err.kind() == ErrorKind::WouldBlock => {}
            Err(err) => {
                debug!("web client read failed: {err}");
                self.open = false;
            }
        }
    }

    fn write_blocking(&mut self, data: &[u8]) -> std::io::Result<()> {
        self.stream.set_nonblocking(false)?;
        let written = self.stream.write_all(data);
        self.stream.set_nonblocking(true)?;
        written
    }
}

impl WebConnection for TcpConnection {
    fn is_connected(&mut self) -> bool {
        if self.open && self.pending.is_empty() {
            self.fill();
        }
        self.open || !self.pending.is_empty()
    }

    fn read_byte(&mut self) -> Option<u8> {
        if self.open && self.pending.is_empty() {
            self.fill();
        }
        self.pending.pop_front()
    }

    fn write_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.write_blocking(data)
            .map_err(|err| TransportError::Write(err.to_string()))
    }

    fn close(&mut self) {
        let _ = self.stream.flush();
        let _ = self.stream.shutdown(Shutdown::Both);
        self.open = false;
    }
}
