// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 natyamatsya contributors
//
// Identity-routed message transport over Unix-domain stream sockets.
//
// One router (the scheduler) accepts any number of dealers (clients and
// workers). A dealer announces an opaque identity in its first datagram;
// after that, the router addresses it by identity alone, the way a ROUTER
// socket addresses DEALER peers.
//
// Stream framing: a datagram is a little-endian `u32` frame count followed
// by `u32`-length-prefixed frames. Data datagrams carry `[empty, payload]`;
// the router prepends the sender identity on receipt and strips the target
// identity on send, so application code only ever sees `(identity, payload)`.

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::os::unix::io::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use log::debug;

/// Upper bound on frames per datagram.
const MAX_FRAMES: usize = 16;
/// Upper bound on a single frame. Control-plane records are tiny; anything
/// near this limit is a corrupt stream.
const MAX_FRAME_LEN: usize = 64 << 20;

/// Read chunk size for the router's per-peer buffers.
const READ_CHUNK: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Datagram codec
// ---------------------------------------------------------------------------

fn encode_datagram(frames: &[&[u8]]) -> Vec<u8> {
    let total: usize = 4 + frames.iter().map(|f| 4 + f.len()).sum::<usize>();
    let mut buf = Vec::with_capacity(total);
    buf.extend_from_slice(&(frames.len() as u32).to_le_bytes());
    for f in frames {
        buf.extend_from_slice(&(f.len() as u32).to_le_bytes());
        buf.extend_from_slice(f);
    }
    buf
}

fn malformed(what: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, format!("malformed datagram: {what}"))
}

/// Try to parse one complete datagram from the front of `buf`.
/// Returns `Ok(None)` when more bytes are needed, `Err` on a corrupt stream.
fn try_parse_datagram(buf: &[u8]) -> io::Result<Option<(Vec<Vec<u8>>, usize)>> {
    if buf.len() < 4 {
        return Ok(None);
    }
    let nframes = u32::from_le_bytes(buf[..4].try_into().unwrap()) as usize;
    if nframes == 0 || nframes > MAX_FRAMES {
        return Err(malformed("frame count"));
    }
    let mut off = 4;
    let mut frames = Vec::with_capacity(nframes);
    for _ in 0..nframes {
        if buf.len() < off + 4 {
            return Ok(None);
        }
        let len = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as usize;
        if len > MAX_FRAME_LEN {
            return Err(malformed("frame length"));
        }
        off += 4;
        if buf.len() < off + len {
            return Ok(None);
        }
        frames.push(buf[off..off + len].to_vec());
        off += len;
    }
    Ok(Some((frames, off)))
}

// ---------------------------------------------------------------------------
// poll(2) helpers
// ---------------------------------------------------------------------------

fn timeout_ms(timeout: Option<Duration>) -> libc::c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let ms = d.as_millis();
            if ms == 0 && !d.is_zero() {
                1 // round sub-millisecond waits up instead of busy-spinning
            } else {
                ms.min(libc::c_int::MAX as u128) as libc::c_int
            }
        }
    }
}

/// Wait until `fd` is readable. Returns `false` on timeout.
fn poll_readable(fd: libc::c_int, timeout: Option<Duration>) -> io::Result<bool> {
    let mut pfd = libc::pollfd {
        fd,
        events: libc::POLLIN,
        revents: 0,
    };
    loop {
        let rc = unsafe { libc::poll(&mut pfd, 1, timeout_ms(timeout)) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                continue;
            }
            return Err(e);
        }
        return Ok(rc > 0);
    }
}

// ---------------------------------------------------------------------------
// DealerSocket
// ---------------------------------------------------------------------------

/// Client/worker side of the transport: one long-lived connection to the
/// router, tagged with an opaque identity.
pub struct DealerSocket {
    stream: UnixStream,
    identity: Vec<u8>,
}

impl DealerSocket {
    /// Connect to a router and announce `identity`.
    pub fn connect<P: AsRef<Path>>(path: P, identity: &[u8]) -> io::Result<Self> {
        let stream = UnixStream::connect(path)?;
        let mut sock = Self {
            stream,
            identity: identity.to_vec(),
        };
        sock.write_datagram(&[identity])?;
        Ok(sock)
    }

    pub fn identity(&self) -> &[u8] {
        &self.identity
    }

    /// Send one payload to the router.
    pub fn send(&mut self, payload: &[u8]) -> io::Result<()> {
        self.write_datagram(&[&[], payload])
    }

    /// Receive the next payload. `None` on timeout; `timeout = None` blocks.
    pub fn recv(&mut self, timeout: Option<Duration>) -> io::Result<Option<Vec<u8>>> {
        if !poll_readable(self.stream.as_raw_fd(), timeout)? {
            return Ok(None);
        }
        let frames = self.read_datagram()?;
        // The payload is the last frame (identity/delimiter frames precede it).
        Ok(frames.into_iter().next_back())
    }

    fn write_datagram(&mut self, frames: &[&[u8]]) -> io::Result<()> {
        let buf = encode_datagram(frames);
        self.stream.write_all(&buf)
    }

    fn read_datagram(&mut self) -> io::Result<Vec<Vec<u8>>> {
        let mut hdr = [0u8; 4];
        self.stream.read_exact(&mut hdr)?;
        let nframes = u32::from_le_bytes(hdr) as usize;
        if nframes == 0 || nframes > MAX_FRAMES {
            return Err(malformed("frame count"));
        }
        let mut frames = Vec::with_capacity(nframes);
        for _ in 0..nframes {
            let mut len_buf = [0u8; 4];
            self.stream.read_exact(&mut len_buf)?;
            let len = u32::from_le_bytes(len_buf) as usize;
            if len > MAX_FRAME_LEN {
                return Err(malformed("frame length"));
            }
            let mut data = vec![0u8; len];
            self.stream.read_exact(&mut data)?;
            frames.push(data);
        }
        Ok(frames)
    }
}

// ---------------------------------------------------------------------------
// RouterSocket
// ---------------------------------------------------------------------------

struct Peer {
    stream: UnixStream,
    identity: Option<Vec<u8>>,
    inbuf: Vec<u8>,
}

/// Scheduler side of the transport: accepts dealers, tags inbound datagrams
/// with the sender identity, and addresses outbound datagrams by identity.
pub struct RouterSocket {
    listener: UnixListener,
    path: PathBuf,
    peers: Vec<Peer>,
    ready: VecDeque<(Vec<u8>, Vec<u8>)>,
}

impl RouterSocket {
    pub fn bind<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        // A socket file left behind by a previous run blocks bind.
        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        listener.set_nonblocking(true)?;
        Ok(Self {
            listener,
            path,
            peers: Vec::new(),
            ready: VecDeque::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether an identity is currently connected.
    pub fn has_peer(&self, identity: &[u8]) -> bool {
        self.peers
            .iter()
            .any(|p| p.identity.as_deref() == Some(identity))
    }

    /// Receive the next `(identity, payload)` in arrival order. Blocks.
    pub fn recv(&mut self) -> io::Result<(Vec<u8>, Vec<u8>)> {
        loop {
            if let Some(m) = self.ready.pop_front() {
                return Ok(m);
            }
            self.poll_once(None)?;
        }
    }

    /// Receive with a timeout. `None` when nothing arrived in time.
    pub fn recv_timeout(&mut self, timeout: Duration) -> io::Result<Option<(Vec<u8>, Vec<u8>)>> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(m) = self.ready.pop_front() {
                return Ok(Some(m));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.poll_once(Some(remaining))?;
        }
    }

    /// Send `payload` to the peer registered under `identity`.
    ///
    /// Returns `false` when the identity is unknown or its connection is
    /// dead. The datagram is dropped — results addressed to vanished
    /// endpoints are never replayed.
    pub fn send(&mut self, identity: &[u8], payload: &[u8]) -> bool {
        let idx = match self
            .peers
            .iter()
            .position(|p| p.identity.as_deref() == Some(identity))
        {
            Some(i) => i,
            None => return false,
        };
        let buf = encode_datagram(&[&[], payload]);
        match self.peers[idx].stream.write_all(&buf) {
            Ok(()) => true,
            Err(e) => {
                debug!("router: dropping peer on write error: {e}");
                self.peers.swap_remove(idx);
                false
            }
        }
    }

    /// One readiness round: accept new peers, read what is readable, queue
    /// completed datagrams.
    fn poll_once(&mut self, timeout: Option<Duration>) -> io::Result<()> {
        let mut fds = Vec::with_capacity(self.peers.len() + 1);
        fds.push(libc::pollfd {
            fd: self.listener.as_raw_fd(),
            events: libc::POLLIN,
            revents: 0,
        });
        for p in &self.peers {
            fds.push(libc::pollfd {
                fd: p.stream.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            });
        }

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms(timeout)) };
        if rc < 0 {
            let e = io::Error::last_os_error();
            if e.raw_os_error() == Some(libc::EINTR) {
                return Ok(());
            }
            return Err(e);
        }
        if rc == 0 {
            return Ok(());
        }

        let npeers = self.peers.len();

        if fds[0].revents & libc::POLLIN != 0 {
            self.accept_pending();
        }

        // Reverse order keeps fds[i+1] ↔ peers[i] valid across swap_remove
        // (newly accepted peers sit past `npeers` and are polled next round).
        for i in (0..npeers).rev() {
            let re = fds[i + 1].revents;
            if re & (libc::POLLIN | libc::POLLHUP | libc::POLLERR) == 0 {
                continue;
            }
            if !self.read_peer(i) {
                self.peers.swap_remove(i);
            }
        }
        Ok(())
    }

    fn accept_pending(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, _)) => {
                    self.peers.push(Peer {
                        stream,
                        identity: None,
                        inbuf: Vec::new(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    debug!("router: accept failed: {e}");
                    return;
                }
            }
        }
    }

    /// Drain readable bytes from peer `i` and queue completed datagrams.
    /// Returns `false` when the peer must be dropped.
    fn read_peer(&mut self, i: usize) -> bool {
        let mut chunk = [0u8; READ_CHUNK];
        let n = match self.peers[i].stream.read(&mut chunk) {
            Ok(0) => return false, // peer hung up
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return true,
            Err(e) => {
                debug!("router: dropping peer on read error: {e}");
                return false;
            }
        };
        self.peers[i].inbuf.extend_from_slice(&chunk[..n]);

        loop {
            match try_parse_datagram(&self.peers[i].inbuf) {
                Ok(None) => return true,
                Ok(Some((frames, consumed))) => {
                    self.peers[i].inbuf.drain(..consumed);
                    self.dispatch_datagram(i, frames);
                }
                Err(e) => {
                    debug!("router: dropping peer on {e}");
                    return false;
                }
            }
        }
    }

    fn dispatch_datagram(&mut self, i: usize, frames: Vec<Vec<u8>>) {
        if self.peers[i].identity.is_none() {
            // First datagram announces the identity. A reconnect under the
            // same identity supersedes the stale registration; the stale
            // connection is de-registered in place and dies on its own.
            let identity = frames.into_iter().next().unwrap_or_default();
            for p in self.peers.iter_mut() {
                if p.identity.as_deref() == Some(identity.as_slice()) {
                    debug!(
                        "router: identity {:?} reconnected, superseding stale peer",
                        String::from_utf8_lossy(&identity)
                    );
                    p.identity = None;
                }
            }
            self.peers[i].identity = Some(identity);
            return;
        }
        let identity = self.peers[i].identity.clone().unwrap();
        if let Some(payload) = frames.into_iter().next_back() {
            self.ready.push_back((identity, payload));
        }
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn datagram_codec_roundtrip() {
        let buf = encode_datagram(&[b"", b"hello"]);
        let (frames, consumed) = try_parse_datagram(&buf).unwrap().unwrap();
        assert_eq!(consumed, buf.len());
        assert_eq!(frames, vec![b"".to_vec(), b"hello".to_vec()]);
    }

    #[test]
    fn datagram_codec_partial() {
        let buf = encode_datagram(&[b"payload"]);
        assert!(try_parse_datagram(&buf[..buf.len() - 1]).unwrap().is_none());
        assert!(try_parse_datagram(&buf[..3]).unwrap().is_none());
    }

    #[test]
    fn datagram_codec_rejects_garbage() {
        // Frame count of zero and absurd frame counts are both corrupt.
        assert!(try_parse_datagram(&0u32.to_le_bytes()).is_err());
        assert!(try_parse_datagram(&u32::MAX.to_le_bytes()).is_err());
    }

    #[test]
    fn two_datagrams_in_one_buffer() {
        let mut buf = encode_datagram(&[b"", b"first"]);
        buf.extend_from_slice(&encode_datagram(&[b"", b"second"]));
        let (frames, consumed) = try_parse_datagram(&buf).unwrap().unwrap();
        assert_eq!(frames[1], b"first");
        let (frames2, _) = try_parse_datagram(&buf[consumed..]).unwrap().unwrap();
        assert_eq!(frames2[1], b"second");
    }
}
