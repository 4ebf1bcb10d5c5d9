//! Relay event loop
//!
//! [`RelayEngine`] owns the smoltcp stack and the packet device. Every TCP
//! flow the host opens into the tunnel is terminated locally and re-dialed
//! through the SOCKS5 listener, which forwards it over the bastion.
//!
//! One pump task per flow moves bytes between the SOCKS5 stream and the
//! engine over bounded channels; the engine alone touches the stack.

use super::stack::RelayStack;
use crate::error::TunnelError;
use crate::tunnel::PacketDevice;
use crate::tunnel::PacketSink;
use bytes::{Buf, Bytes};
use smoltcp::iface::SocketHandle;
use smoltcp::socket::tcp::State;
use smoltcp::wire::{IpProtocol, Ipv4Packet, TcpPacket};
use std::collections::{HashMap, VecDeque};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Largest packet read from the device
const MAX_PACKET_SIZE: usize = 65535;

/// Maximum number of concurrent flows
const MAX_FLOWS: usize = 1024;

/// Depth of the per-flow channels
const FLOW_CHANNEL_SIZE: usize = 32;

/// Read size on the SOCKS5 side
const UPSTREAM_READ_SIZE: usize = 16384;

/// Upper bound on how long the loop sleeps without an event
const MAX_POLL_DELAY: Duration = Duration::from_millis(100);

/// Parameters for one relay session
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Address owned by the user-space stack
    pub stack_address: Ipv4Addr,
    /// Device MTU
    pub mtu: usize,
    /// Flows without traffic for this long are reset
    pub idle_timeout: Duration,
    /// Budget for the SOCKS5 dial of a new flow
    pub dial_timeout: Duration,
    /// Local SOCKS5 listener
    pub socks_addr: SocketAddr,
}

/// Endpoints of one TCP flow, as seen from the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct FlowKey {
    src: SocketAddrV4,
    dst: SocketAddrV4,
}

/// Messages from a pump task to the engine
#[derive(Debug)]
enum FlowEvent {
    Connected,
    Data(Bytes),
    Eof,
    Failed(String),
}

struct Flow {
    handle: SocketHandle,
    events: mpsc::Receiver<FlowEvent>,
    to_upstream: Option<mpsc::Sender<Bytes>>,
    pending: VecDeque<Bytes>,
    upstream_eof: bool,
    closing: bool,
    last_activity: Instant,
    task: JoinHandle<()>,
}

/// Terminates tunnelled TCP flows and relays them through SOCKS5
pub struct RelayEngine {
    settings: RelaySettings,
    stack: RelayStack,
    flows: HashMap<FlowKey, Flow>,
    wake: Arc<Notify>,
}

impl RelayEngine {
    /// Create an engine; the stack owns `settings.stack_address`
    pub fn new(settings: RelaySettings) -> Result<Self, TunnelError> {
        let stack = RelayStack::new(settings.stack_address, settings.mtu)?;
        Ok(Self {
            settings,
            stack,
            flows: HashMap::new(),
            wake: Arc::new(Notify::new()),
        })
    }

    /// Number of tracked flows
    pub fn flow_count(&self) -> usize {
        self.flows.len()
    }

    /// Relay packets until `cancel` fires or the device closes
    pub async fn run(mut self, device: PacketDevice, cancel: CancellationToken) -> Result<(), TunnelError> {
        let PacketDevice {
            mut source,
            mut sink,
            mtu,
        } = device;
        let mut buf = vec![0u8; MAX_PACKET_SIZE.max(mtu)];
        let wake = Arc::clone(&self.wake);

        info!(
            "Relay started: stack={}, socks={}",
            self.settings.stack_address, self.settings.socks_addr
        );

        let result = loop {
            let delay = self
                .stack
                .poll_delay()
                .map_or(MAX_POLL_DELAY, |d| d.min(MAX_POLL_DELAY));

            tokio::select! {
                _ = cancel.cancelled() => break Ok(()),
                read = source.recv(&mut buf) => match read {
                    Ok(0) => {
                        info!("Packet device closed");
                        break Ok(());
                    }
                    Ok(n) => self.on_packet(&buf[..n]),
                    Err(e) => break Err(TunnelError::Device(format!("device read failed: {}", e))),
                },
                _ = wake.notified() => {}
                _ = tokio::time::sleep(delay) => {}
            }

            self.pump_flows();
            self.stack.poll();
            if let Err(e) = self.flush(sink.as_mut()).await {
                break Err(TunnelError::Device(format!("device write failed: {}", e)));
            }
            self.reap();
        };

        self.shutdown(sink.as_mut()).await;
        info!("Relay stopped");
        result
    }

    /// Feed one packet read from the device into the stack
    fn on_packet(&mut self, packet: &[u8]) {
        if packet.first().map(|b| b >> 4) != Some(4) {
            trace!("Dropping non-IPv4 packet ({} bytes)", packet.len());
            return;
        }
        let ip = match Ipv4Packet::new_checked(packet) {
            Ok(ip) => ip,
            Err(e) => {
                trace!("Dropping malformed IPv4 packet: {}", e);
                return;
            }
        };
        if ip.next_header() != IpProtocol::Tcp {
            trace!("Dropping {} packet to {}", ip.next_header(), ip.dst_addr());
            return;
        }
        let tcp = match TcpPacket::new_checked(ip.payload()) {
            Ok(tcp) => tcp,
            Err(e) => {
                trace!("Dropping malformed TCP segment: {}", e);
                return;
            }
        };

        let key = FlowKey {
            src: SocketAddrV4::new(ip.src_addr(), tcp.src_port()),
            dst: SocketAddrV4::new(ip.dst_addr(), tcp.dst_port()),
        };
        if tcp.syn() && !tcp.ack() {
            let stale = self
                .flows
                .get(&key)
                .map(|flow| matches!(self.stack.socket(flow.handle).state(), State::Closed | State::TimeWait))
                .unwrap_or(false);
            if stale {
                self.remove_flow(&key);
            }
            if !self.flows.contains_key(&key) {
                self.open_flow(key);
            }
        }

        self.stack.inject_packet(packet);
        self.stack.poll();
    }

    fn open_flow(&mut self, key: FlowKey) {
        if self.flows.len() >= MAX_FLOWS {
            warn!("Flow limit ({}) reached, refusing {} -> {}", MAX_FLOWS, key.src, key.dst);
            return;
        }
        let handle = match self.stack.listen(key.dst) {
            Ok(handle) => handle,
            Err(e) => {
                warn!("Cannot accept {} -> {}: {}", key.src, key.dst, e);
                return;
            }
        };

        let (events_tx, events_rx) = mpsc::channel(FLOW_CHANNEL_SIZE);
        let (upstream_tx, upstream_rx) = mpsc::channel(FLOW_CHANNEL_SIZE);
        let task = tokio::spawn(pump(
            self.settings.socks_addr,
            key.dst,
            self.settings.dial_timeout,
            events_tx,
            upstream_rx,
            Arc::clone(&self.wake),
        ));

        debug!("Flow {} -> {} opened", key.src, key.dst);
        self.flows.insert(
            key,
            Flow {
                handle,
                events: events_rx,
                to_upstream: Some(upstream_tx),
                pending: VecDeque::new(),
                upstream_eof: false,
                closing: false,
                last_activity: Instant::now(),
                task,
            },
        );
    }

    /// Move data between every flow's socket and its pump task
    fn pump_flows(&mut self) {
        let now = Instant::now();
        let idle_timeout = self.settings.idle_timeout;

        for (key, flow) in self.flows.iter_mut() {
            let socket = self.stack.socket_mut(flow.handle);

            // Towards the host
            loop {
                while let Some(front) = flow.pending.front_mut() {
                    if !socket.can_send() {
                        break;
                    }
                    match socket.send_slice(&front[..]) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            flow.last_activity = now;
                            front.advance(n);
                            if front.is_empty() {
                                flow.pending.pop_front();
                            }
                        }
                    }
                }
                if !flow.pending.is_empty() {
                    break;
                }
                match flow.events.try_recv() {
                    Ok(FlowEvent::Data(data)) => flow.pending.push_back(data),
                    Ok(FlowEvent::Connected) => trace!("Flow {} -> {} dialed", key.src, key.dst),
                    Ok(FlowEvent::Eof) => flow.upstream_eof = true,
                    Ok(FlowEvent::Failed(reason)) => {
                        warn!("Flow {} -> {} failed: {}", key.src, key.dst, reason);
                        socket.abort();
                        break;
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        flow.upstream_eof = true;
                        break;
                    }
                }
            }
            if flow.upstream_eof
                && flow.pending.is_empty()
                && !flow.closing
                && matches!(socket.state(), State::Established | State::CloseWait)
            {
                socket.close();
                flow.closing = true;
            }

            // Towards the bastion
            let mut upstream_closed = false;
            if let Some(tx) = &flow.to_upstream {
                while socket.can_recv() {
                    let permit = match tx.try_reserve() {
                        Ok(permit) => permit,
                        Err(mpsc::error::TrySendError::Full(())) => break,
                        Err(mpsc::error::TrySendError::Closed(())) => {
                            upstream_closed = true;
                            break;
                        }
                    };
                    match socket.recv(|buf| (buf.len(), Bytes::copy_from_slice(buf))) {
                        Ok(data) if !data.is_empty() => {
                            flow.last_activity = now;
                            permit.send(data);
                        }
                        _ => break,
                    }
                }
            }
            if upstream_closed {
                flow.to_upstream = None;
            }
            if flow.to_upstream.is_some()
                && !socket.can_recv()
                && matches!(
                    socket.state(),
                    State::CloseWait | State::LastAck | State::Closing | State::TimeWait | State::Closed
                )
            {
                trace!("Flow {} -> {} half-closed by host", key.src, key.dst);
                flow.to_upstream = None;
            }

            if now.duration_since(flow.last_activity) > idle_timeout && socket.state() != State::Closed {
                debug!("Flow {} -> {} idle, resetting", key.src, key.dst);
                socket.abort();
            }
        }
    }

    async fn flush(&mut self, sink: &mut dyn PacketSink) -> io::Result<()> {
        for packet in self.stack.drain_tx_packets() {
            sink.send(&packet).await?;
        }
        Ok(())
    }

    /// Drop flows whose sockets have finished
    fn reap(&mut self) {
        let done: Vec<FlowKey> = self
            .flows
            .iter()
            .filter(|(_, flow)| matches!(self.stack.socket(flow.handle).state(), State::Closed | State::TimeWait))
            .map(|(key, _)| *key)
            .collect();
        for key in done {
            debug!("Flow {} -> {} closed", key.src, key.dst);
            self.remove_flow(&key);
        }
    }

    fn remove_flow(&mut self, key: &FlowKey) {
        if let Some(flow) = self.flows.remove(key) {
            flow.task.abort();
            self.stack.remove(flow.handle);
        }
    }

    /// Reset every flow and flush the resets
    async fn shutdown(&mut self, sink: &mut dyn PacketSink) {
        if self.flows.is_empty() {
            return;
        }
        debug!("Resetting {} flow(s)", self.flows.len());
        for flow in self.flows.values() {
            self.stack.socket_mut(flow.handle).abort();
            flow.task.abort();
        }
        self.stack.poll();
        for packet in self.stack.drain_tx_packets() {
            let _ = sink.send(&packet).await;
        }
        for (_, flow) in self.flows.drain() {
            self.stack.remove(flow.handle);
        }
    }
}

async fn dial(socks_addr: SocketAddr, target: SocketAddrV4) -> io::Result<TcpStream> {
    let mut stream = TcpStream::connect(socks_addr).await?;
    stream.set_nodelay(true)?;
    async_socks5::connect(&mut stream, SocketAddr::V4(target), None)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))?;
    Ok(stream)
}

/// Dial the flow's target through SOCKS5 and copy bytes both ways
async fn pump(
    socks_addr: SocketAddr,
    target: SocketAddrV4,
    dial_timeout: Duration,
    events: mpsc::Sender<FlowEvent>,
    mut from_host: mpsc::Receiver<Bytes>,
    wake: Arc<Notify>,
) {
    let stream = match tokio::time::timeout(dial_timeout, dial(socks_addr, target)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            let _ = events.send(FlowEvent::Failed(format!("dial {}: {}", target, e))).await;
            wake.notify_one();
            return;
        }
        Err(_) => {
            let _ = events
                .send(FlowEvent::Failed(format!("dial {} timed out", target)))
                .await;
            wake.notify_one();
            return;
        }
    };
    let _ = events.send(FlowEvent::Connected).await;
    wake.notify_one();

    let (mut reader, mut writer) = stream.into_split();

    let downstream = async {
        let mut buf = vec![0u8; UPSTREAM_READ_SIZE];
        loop {
            let event = match reader.read(&mut buf).await {
                Ok(0) => FlowEvent::Eof,
                Ok(n) => FlowEvent::Data(Bytes::copy_from_slice(&buf[..n])),
                Err(e) => FlowEvent::Failed(e.to_string()),
            };
            let last = !matches!(event, FlowEvent::Data(_));
            if events.send(event).await.is_err() {
                break;
            }
            wake.notify_one();
            if last {
                break;
            }
        }
    };

    let upstream = async {
        while let Some(chunk) = from_host.recv().await {
            if let Err(e) = writer.write_all(&chunk).await {
                trace!("Upstream write to {} failed: {}", target, e);
                break;
            }
            wake.notify_one();
        }
        let _ = writer.shutdown().await;
    };

    tokio::join!(downstream, upstream);
}
