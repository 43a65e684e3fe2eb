//! Socket I/O loops for relay links.
//!
//! This module handles:
//! - Batched UDP receive and send with Linux GRO/GSO when available
//! - Splitting a TCP byte stream back into frames, carrying partial frames
//!   across reads
//! - The per-link receive and send loops driven by a shared cancellation
//!   token

#[cfg(target_os = "linux")]
mod linux;

use crate::buffer::{BufferHandle, BufferPool, PackedBuffer};
use crate::gather::{DecodedBatch, FrameSink};
use crate::link::CancelableContext;
use crate::proto::{self, FrameRef, HEADER_SIZE};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

/// Most datagrams handed to the kernel in one GSO send.
pub const MAX_GSO_SEGMENTS: usize = 64;

/// Offload features actually enabled on a socket.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Offload {
    pub gro: bool,
    pub gso: bool,
}

/// Turn on the requested offloads. Anything the platform refuses is logged
/// and reported as off.
pub fn enable_offload(sock: &UdpSocket, gro: bool, gso: bool) -> Offload {
    let mut offload = Offload::default();
    if gro {
        match sys::enable_gro(sock) {
            Ok(()) => offload.gro = true,
            Err(e) => tracing::warn!("UDP GRO unavailable: {e}"),
        }
    }
    if gso {
        match sys::check_gso(sock) {
            Ok(()) => offload.gso = true,
            Err(e) => tracing::warn!("UDP GSO unavailable: {e}"),
        }
    }
    offload
}

#[cfg(target_os = "linux")]
mod sys {
    use super::linux;
    use std::io;
    use std::net::SocketAddr;
    use std::os::fd::AsRawFd;
    use tokio::io::Interest;
    use tokio::net::UdpSocket;

    pub fn enable_gro(sock: &UdpSocket) -> io::Result<()> {
        linux::enable_gro(sock.as_raw_fd())
    }

    pub fn check_gso(sock: &UdpSocket) -> io::Result<()> {
        linux::check_gso(sock.as_raw_fd())
    }

    pub async fn recv(
        sock: &UdpSocket,
        buf: &mut [u8],
    ) -> io::Result<(usize, Option<usize>, SocketAddr)> {
        loop {
            sock.readable().await?;
            match sock.try_io(Interest::READABLE, || linux::recv_gro(sock.as_raw_fd(), buf)) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                other => return other,
            }
        }
    }

    pub async fn send_gso(
        sock: &UdpSocket,
        dst: Option<SocketAddr>,
        data: &[u8],
        segment: u16,
    ) -> io::Result<usize> {
        loop {
            sock.writable().await?;
            match sock.try_io(Interest::WRITABLE, || {
                linux::send_gso(sock.as_raw_fd(), dst, data, segment)
            }) {
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => continue,
                other => return other,
            }
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod sys {
    use std::io;
    use std::net::SocketAddr;
    use tokio::net::UdpSocket;

    fn unsupported() -> io::Error {
        io::Error::new(
            io::ErrorKind::Unsupported,
            "UDP segmentation offload requires Linux",
        )
    }

    pub fn enable_gro(_sock: &UdpSocket) -> io::Result<()> {
        Err(unsupported())
    }

    pub fn check_gso(_sock: &UdpSocket) -> io::Result<()> {
        Err(unsupported())
    }

    pub async fn recv(
        sock: &UdpSocket,
        buf: &mut [u8],
    ) -> io::Result<(usize, Option<usize>, SocketAddr)> {
        let (n, from) = sock.recv_from(buf).await?;
        Ok((n, None, from))
    }

    pub async fn send_gso(
        _sock: &UdpSocket,
        _dst: Option<SocketAddr>,
        _data: &[u8],
        _segment: u16,
    ) -> io::Result<usize> {
        Err(unsupported())
    }
}

/// Receive one (possibly GRO-coalesced) read into `buf`, splitting it into
/// its original datagrams.
pub async fn recv_segments(sock: &UdpSocket, buf: &mut PackedBuffer) -> io::Result<SocketAddr> {
    let (len, segment, from) = sys::recv(sock, buf.region_mut()).await?;
    buf.set_segmented(len, segment.unwrap_or(len));
    Ok(from)
}

/// Send every sub-packet of `buf` as its own datagram, to `dst` or to the
/// connected peer.
///
/// With `gso` set, equal-sized runs of 2 to [`MAX_GSO_SEGMENTS`] datagrams go
/// out in a single call; if the kernel rejects that, they are sent one by one.
pub async fn send_segments(
    sock: &UdpSocket,
    dst: Option<SocketAddr>,
    buf: &PackedBuffer,
    gso: bool,
) -> io::Result<()> {
    if gso {
        if let Some(segment) = gso_segment(buf) {
            match sys::send_gso(sock, dst, buf.data(), segment).await {
                Ok(_) => return Ok(()),
                Err(e) => tracing::debug!("GSO send failed, falling back: {e}"),
            }
        }
    }

    for datagram in buf.segments() {
        match dst {
            Some(addr) => sock.send_to(datagram, addr).await?,
            None => sock.send(datagram).await?,
        };
    }
    Ok(())
}

fn gso_segment(buf: &PackedBuffer) -> Option<u16> {
    let count = buf.sub_packets().len();
    if !(2..=MAX_GSO_SEGMENTS).contains(&count) {
        return None;
    }
    buf.uniform_segment()
        .filter(|&len| len > 0)
        .and_then(|len| u16::try_from(len).ok())
}

/// Decode one frame per sub-packet. Datagrams that fail to decode are
/// logged and skipped.
pub fn decode_segments(buffer: BufferHandle) -> DecodedBatch {
    let mut frames = Vec::with_capacity(buffer.sub_packets().len());
    let mut offset = 0;
    for &len in buffer.sub_packets() {
        let datagram = &buffer.data()[offset..offset + len];
        match proto::decode(datagram) {
            Ok((packet, used)) => {
                if used != len {
                    tracing::debug!(used, len, "trailing bytes after frame in datagram");
                }
                frames.push(FrameRef {
                    conn_id: packet.conn_id,
                    packet_id: packet.packet_id,
                    offset: offset + HEADER_SIZE,
                    len: packet.payload.len(),
                });
            }
            Err(e) => tracing::debug!(len, "dropping undecodable datagram: {e}"),
        }
        offset += len;
    }
    DecodedBatch::new(buffer, frames)
}

/// Errors that concern one datagram rather than the socket.
pub fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::InvalidData
            | io::ErrorKind::Interrupted
    )
}

/// Receive datagrams until cancelled, decoding them into `sink`.
///
/// With `peer` set, datagrams from any other source are dropped.
pub async fn udp_recv_loop<C, S>(
    ctx: Arc<C>,
    sock: Arc<UdpSocket>,
    peer: Option<SocketAddr>,
    pool: BufferPool,
    sink: Arc<S>,
) where
    C: CancelableContext + ?Sized,
    S: FrameSink + ?Sized,
{
    loop {
        let mut handle = pool.allocate();
        let Some(buf) = handle.get_mut() else {
            return;
        };
        let received = tokio::select! {
            received = recv_segments(&sock, buf) => received,
            _ = ctx.token().cancelled() => return,
        };

        match received {
            Ok(from) => {
                if peer.is_some_and(|p| p != from) {
                    tracing::debug!(%from, "dropping datagram from unexpected source");
                    continue;
                }
                sink.forward(decode_segments(handle));
            }
            Err(e) if is_transient(&e) => {
                tracing::debug!("udp receive: {e}");
            }
            Err(e) => {
                tracing::warn!("udp receive failed: {e}");
                ctx.cancel();
                return;
            }
        }
    }
}

/// Drain `queue` onto `sock` until cancelled or the queue closes.
pub async fn udp_send_loop<C>(
    ctx: Arc<C>,
    sock: Arc<UdpSocket>,
    dst: Option<SocketAddr>,
    offload: Offload,
    mut queue: mpsc::Receiver<BufferHandle>,
) where
    C: CancelableContext + ?Sized,
{
    loop {
        let batch = tokio::select! {
            batch = queue.recv() => batch,
            _ = ctx.token().cancelled() => return,
        };
        let Some(batch) = batch else {
            return;
        };

        let sent = tokio::select! {
            sent = send_segments(&sock, dst, &batch, offload.gso) => sent,
            _ = ctx.token().cancelled() => return,
        };
        match sent {
            Ok(()) => {}
            Err(e) if is_transient(&e) => tracing::debug!("udp send: {e}"),
            Err(e) => {
                tracing::warn!(bytes = batch.total_size(), "udp send failed: {e}");
                ctx.cancel();
                return;
            }
        }
    }
}

/// Read a framed TCP stream until EOF, error or cancellation.
///
/// Bytes of a frame cut off at the end of one read are copied to the front
/// of the next buffer. A region that fills up without a single decodable
/// frame is discarded.
pub async fn tcp_recv_loop<C, R, S>(ctx: Arc<C>, mut reader: R, pool: BufferPool, sink: Arc<S>)
where
    C: CancelableContext + ?Sized,
    R: AsyncRead + Unpin,
    S: FrameSink + ?Sized,
{
    let mut carry: Option<(BufferHandle, usize)> = None;
    loop {
        let mut handle = pool.allocate();
        let Some(buf) = handle.get_mut() else {
            return;
        };

        let mut filled = 0;
        if let Some((prev, len)) = carry.take() {
            let tail = &prev.data()[prev.total_size() - len..];
            buf.region_mut()[..len].copy_from_slice(tail);
            filled = len;
        }

        let read = tokio::select! {
            read = reader.read(&mut buf.region_mut()[filled..]) => read,
            _ = ctx.token().cancelled() => return,
        };
        let n = match read {
            Ok(0) => {
                tracing::debug!("tcp peer closed the stream");
                ctx.cancel();
                return;
            }
            Ok(n) => n,
            Err(e) => {
                tracing::warn!("tcp receive failed: {e}");
                ctx.cancel();
                return;
            }
        };
        buf.set_filled(filled + n);

        let (frames, trailing) = proto::decode_stream(handle.data());
        if trailing == handle.capacity() {
            tracing::warn!(bytes = trailing, "discarding unframed tcp data");
        } else if trailing > 0 {
            carry = Some((handle.share(), trailing));
        }
        if !frames.is_empty() {
            sink.forward(DecodedBatch::new(handle, frames));
        }
    }
}

/// Write queued batches to a TCP stream until cancelled or the queue closes.
pub async fn tcp_send_loop<C, W>(ctx: Arc<C>, mut writer: W, mut queue: mpsc::Receiver<BufferHandle>)
where
    C: CancelableContext + ?Sized,
    W: AsyncWrite + Unpin,
{
    loop {
        let batch = tokio::select! {
            batch = queue.recv() => batch,
            _ = ctx.token().cancelled() => return,
        };
        let Some(batch) = batch else {
            return;
        };

        let written = tokio::select! {
            written = writer.write_all(batch.data()) => written,
            _ = ctx.token().cancelled() => return,
        };
        if let Err(e) = written {
            tracing::warn!(bytes = batch.total_size(), "tcp send failed: {e}");
            ctx.cancel();
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gather::Gatherer;
    use crate::link::LinkContext;
    use crate::proto::{encode, push_frame, Packet};
    use crate::stats::FlowStats;
    use tokio_util::sync::CancellationToken;

    fn frame(conn_id: u16, packet_id: u16, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; HEADER_SIZE + payload.len()];
        encode(&Packet::new(conn_id, packet_id, payload), &mut out);
        out
    }

    fn context() -> Arc<LinkContext> {
        LinkContext::new("127.0.0.1:1".parse().unwrap(), CancellationToken::new())
    }

    #[test]
    fn test_gso_segment_requires_uniform_run() {
        let pool = BufferPool::new(2);
        let mut handle = pool.allocate();
        let buf = handle.get_mut().unwrap();
        buf.append(&[0; 100]);
        assert_eq!(gso_segment(buf), None);
        buf.append(&[0; 100]);
        assert_eq!(gso_segment(buf), Some(100));
        buf.append(&[0; 40]);
        assert_eq!(gso_segment(buf), None);

        buf.clear();
        for _ in 0..=MAX_GSO_SEGMENTS {
            buf.append(&[0; 10]);
        }
        assert_eq!(gso_segment(buf), None);
    }

    #[test]
    fn test_decode_segments_skips_garbage() {
        let pool = BufferPool::new(2);
        let mut handle = pool.allocate();
        let buf = handle.get_mut().unwrap();
        assert!(push_frame(buf, &Packet::new(3, 1, b"one")));
        buf.append(b"not a frame");
        assert!(push_frame(buf, &Packet::new(3, 2, b"two")));

        let batch = decode_segments(handle);
        let payloads: Vec<&[u8]> = batch.iter().map(|(_, p)| p).collect();
        assert_eq!(payloads, vec![&b"one"[..], &b"two"[..]]);
    }

    #[tokio::test]
    async fn test_udp_send_and_recv_segments() {
        let rx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let tx = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let offload = enable_offload(&tx, true, true);

        let pool = BufferPool::new(4);
        let mut out = pool.allocate();
        for i in 0..4u8 {
            out.get_mut().unwrap().append(&[i; 32]);
        }
        send_segments(&tx, Some(rx.local_addr().unwrap()), &out, offload.gso)
            .await
            .unwrap();

        let mut seen = Vec::new();
        while seen.len() < 4 {
            let mut handle = pool.allocate();
            let from = recv_segments(&rx, handle.get_mut().unwrap()).await.unwrap();
            assert_eq!(from, tx.local_addr().unwrap());
            seen.extend(handle.segments().map(|s| s.to_vec()));
        }
        assert_eq!(seen.len(), 4);
        for (i, datagram) in seen.iter().enumerate() {
            assert_eq!(datagram, &vec![i as u8; 32]);
        }
    }

    #[tokio::test]
    async fn test_tcp_recv_reassembles_split_frames() {
        let (mut client, server) = tokio::io::duplex(16);
        let pool = BufferPool::new(8);
        let (gatherer, mut gathered) = Gatherer::new(16, FlowStats::new());
        let ctx = context();
        let task = tokio::spawn(tcp_recv_loop(
            Arc::clone(&ctx),
            server,
            pool.clone(),
            Arc::new(gatherer),
        ));

        let mut stream = frame(1, 1, b"first payload");
        stream.extend(frame(1, 2, b"second"));
        for chunk in stream.chunks(5) {
            client.write_all(chunk).await.unwrap();
        }
        drop(client);

        let mut payloads = Vec::new();
        while payloads.len() < 2 {
            let batch = gathered.recv().await.unwrap();
            payloads.extend(batch.iter().map(|(_, p)| p.to_vec()));
        }
        assert_eq!(payloads, vec![b"first payload".to_vec(), b"second".to_vec()]);

        task.await.unwrap();
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_tcp_send_loop_writes_and_exits_on_close() {
        let (writer, mut reader) = tokio::io::duplex(1024);
        let (tx, queue) = mpsc::channel(4);
        let pool = BufferPool::new(4);
        let ctx = context();
        let task = tokio::spawn(tcp_send_loop(Arc::clone(&ctx), writer, queue));

        let mut batch = pool.allocate();
        assert!(push_frame(batch.get_mut().unwrap(), &Packet::new(9, 9, b"hi")));
        let expected = batch.data().to_vec();
        tx.send(batch).await.unwrap();
        drop(tx);
        task.await.unwrap();

        let mut wire = Vec::new();
        reader.read_to_end(&mut wire).await.unwrap();
        assert_eq!(wire, expected);
        assert!(!ctx.is_cancelled());
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_loops_exit_on_cancel_and_release() {
        let sock = Arc::new(UdpSocket::bind("127.0.0.1:0").await.unwrap());
        let pool = BufferPool::new(4);
        let ctx = context();
        let (_tx, queue) = mpsc::channel(4);

        let recv = tokio::spawn(udp_recv_loop(
            Arc::clone(&ctx),
            Arc::clone(&sock),
            None,
            pool.clone(),
            Arc::new(crate::gather::Discard),
        ));
        let send = tokio::spawn(udp_send_loop(
            Arc::clone(&ctx),
            sock,
            None,
            Offload::default(),
            queue,
        ));

        ctx.cancel();
        recv.await.unwrap();
        send.await.unwrap();
        assert_eq!(pool.outstanding(), 0);
    }
}
