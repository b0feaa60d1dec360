//! Capture/encode back-ends feeding the shared graph
//!
//! [`ExternalEncoderSource`] runs the capture-and-encode chain as a
//! `gst-launch-1.0` child process that delivers payloaded RTP to loopback
//! UDP sockets; the reader tasks unmarshal the datagrams and push them into
//! the tees. [`SyntheticSource`] produces timed dummy RTP for tests and
//! wire-up checks without touching any capture hardware.

use crate::config::CameraKind;
use crate::media::graph::{
    EncoderControl, GraphEvent, MediaSource, TeeInput, AUDIO_PAYLOAD_TYPE, VIDEO_PAYLOAD_TYPE,
};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use webrtc::rtp::header::Header;
use webrtc::rtp::packet::Packet;
use webrtc::util::Unmarshal;

/// Target video bitrate in kbit/s for the shared encoder
const VIDEO_BITRATE_KBPS: u32 = 2000;

/// GOP ceiling configured at encoder launch (one IDR per second at 30 fps)
const VIDEO_KEY_INT_MAX: u32 = 30;

/// Opus bitrate in bit/s
const AUDIO_BITRATE: u32 = 32_000;

/// Build the capture part of the video launch description
fn video_capture_description(camera: CameraKind, video_device: &str) -> String {
    match camera {
        CameraKind::Csi => "libcamerasrc ! \
             video/x-raw,width=1280,height=720,framerate=30/1,format=NV12 ! \
             videoconvert ! video/x-raw,format=I420"
            .to_string(),
        CameraKind::LegacyCsi => "rpicamsrc ! \
             video/x-raw,width=1280,height=720,framerate=30/1 ! \
             videoconvert"
            .to_string(),
        CameraKind::Usb => format!(
            "v4l2src device={} ! \
             video/x-raw,width=1280,height=720,framerate=30/1 ! \
             videoconvert ! queue max-size-buffers=3 leaky=downstream",
            video_device
        ),
    }
}

/// Full launch description: capture, encode once, payload, deliver over UDP
fn launch_description(
    camera: CameraKind,
    video_device: &str,
    audio_device: &str,
    video_port: u16,
    audio_port: u16,
) -> String {
    format!(
        "{capture} ! \
         x264enc name=video_encoder tune=zerolatency speed-preset=ultrafast \
         bitrate={vbitrate} key-int-max={keyint} bframes=0 ! \
         video/x-h264,profile=constrained-baseline ! \
         h264parse config-interval=-1 ! \
         rtph264pay config-interval=-1 pt={vpt} aggregate-mode=zero-latency ! \
         udpsink host=127.0.0.1 port={vport} \
         alsasrc device={adev} ! \
         audioconvert ! audioresample ! audio/x-raw,rate=48000,channels=1 ! \
         queue max-size-buffers=3 leaky=downstream ! \
         opusenc bitrate={abitrate} ! \
         rtpopuspay pt={apt} ! \
         udpsink host=127.0.0.1 port={aport}",
        capture = video_capture_description(camera, video_device),
        vbitrate = VIDEO_BITRATE_KBPS,
        keyint = VIDEO_KEY_INT_MAX,
        vpt = VIDEO_PAYLOAD_TYPE,
        vport = video_port,
        adev = audio_device,
        abitrate = AUDIO_BITRATE,
        apt = AUDIO_PAYLOAD_TYPE,
        aport = audio_port,
    )
}

/// Capture back-end running the encode chain as an external process
pub struct ExternalEncoderSource {
    camera: CameraKind,
    video_device: String,
    audio_device: String,
    control: Arc<ExternalEncoderControl>,
    running: Arc<Mutex<Option<RunningChild>>>,
}

struct RunningChild {
    child: tokio::process::Child,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: watch::Sender<bool>,
}

impl ExternalEncoderSource {
    pub fn new(camera: CameraKind, video_device: &str, audio_device: &str) -> Arc<Self> {
        Arc::new(Self {
            camera,
            video_device: video_device.to_string(),
            audio_device: audio_device.to_string(),
            control: Arc::new(ExternalEncoderControl::new()),
            running: Arc::new(Mutex::new(None)),
        })
    }

    /// Reader loop: unmarshal RTP datagrams and push them into one tee
    async fn reader_loop(
        socket: UdpSocket,
        input: TeeInput,
        media: &'static str,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut buf = vec![0u8; 1500];
        loop {
            tokio::select! {
                _ = shutdown_rx.changed() => break,
                received = socket.recv(&mut buf) => {
                    match received {
                        Ok(n) => {
                            let mut raw = &buf[..n];
                            match Packet::unmarshal(&mut raw) {
                                Ok(packet) => input.push(packet),
                                Err(e) => debug!(media, "dropping malformed RTP datagram: {}", e),
                            }
                        }
                        Err(e) => {
                            warn!(media, "UDP receive error: {}", e);
                            break;
                        }
                    }
                }
            }
        }
        debug!(media, "RTP reader loop ended");
    }
}

#[async_trait]
impl MediaSource for ExternalEncoderSource {
    async fn start(
        &self,
        video: TeeInput,
        audio: TeeInput,
        events: mpsc::UnboundedSender<GraphEvent>,
    ) -> Result<()> {
        let video_socket = UdpSocket::bind("127.0.0.1:0").await?;
        let audio_socket = UdpSocket::bind("127.0.0.1:0").await?;
        let video_port = video_socket.local_addr()?.port();
        let audio_port = audio_socket.local_addr()?.port();

        let description = launch_description(
            self.camera,
            &self.video_device,
            &self.audio_device,
            video_port,
            audio_port,
        );
        info!(video_port, audio_port, "launching capture pipeline");
        debug!("pipeline: {}", description);

        let mut child = tokio::process::Command::new("gst-launch-1.0")
            .arg("-q")
            .args(description.split_whitespace())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Graph(format!("failed to launch capture pipeline: {}", e)))?;

        // A pipeline that dies immediately (bad device, missing plugin) is a
        // construction failure, not a runtime fault.
        tokio::time::sleep(Duration::from_millis(200)).await;
        if let Ok(Some(status)) = child.try_wait() {
            return Err(Error::Graph(format!(
                "capture pipeline exited at startup with {}",
                status
            )));
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        tasks.push(tokio::spawn(Self::reader_loop(
            video_socket,
            video,
            "video",
            shutdown_rx.clone(),
        )));
        tasks.push(tokio::spawn(Self::reader_loop(
            audio_socket,
            audio,
            "audio",
            shutdown_rx.clone(),
        )));

        *self.running.lock().await = Some(RunningChild {
            child,
            tasks,
            shutdown_tx,
        });

        // Watch for the child dying mid-stream; that is a bus-level fatal.
        let running = Arc::clone(&self.running);
        let mut exit_shutdown = shutdown_rx;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = exit_shutdown.changed() => return,
                    _ = tokio::time::sleep(Duration::from_millis(500)) => {}
                }
                let status = {
                    let mut guard = running.lock().await;
                    match guard.as_mut() {
                        Some(child) => child.child.try_wait().ok().flatten(),
                        None => return,
                    }
                };
                if let Some(status) = status {
                    error!("capture pipeline exited unexpectedly: {}", status);
                    let _ = events.send(GraphEvent::Fatal(format!(
                        "capture pipeline exited: {}",
                        status
                    )));
                    return;
                }
            }
        });

        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        if let Some(mut running) = self.running.lock().await.take() {
            let _ = running.shutdown_tx.send(true);
            if let Err(e) = running.child.kill().await {
                warn!("failed to kill capture pipeline: {}", e);
            }
            for task in running.tasks {
                let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
            }
        }
        Ok(())
    }

    fn encoder_control(&self) -> Arc<dyn EncoderControl> {
        Arc::clone(&self.control) as Arc<dyn EncoderControl>
    }
}

/// Encoder control of the external chain
///
/// The encoder lives in the child process, so an explicit key-unit request
/// cannot be delivered; the GOP ceiling of 30 frames bounds the wait for
/// the next IDR to about a second.
pub struct ExternalEncoderControl {
    key_int_max: AtomicU32,
}

impl ExternalEncoderControl {
    fn new() -> Self {
        Self {
            key_int_max: AtomicU32::new(VIDEO_KEY_INT_MAX),
        }
    }
}

impl EncoderControl for ExternalEncoderControl {
    fn request_key_unit(&self) -> bool {
        false
    }

    fn key_int_max(&self) -> u32 {
        self.key_int_max.load(Ordering::Relaxed)
    }

    fn set_key_int_max(&self, frames: u32) {
        // Bookkeeping only: the launched encoder's GOP is fixed at startup.
        self.key_int_max.store(frames, Ordering::Relaxed);
        debug!(frames, "GOP ceiling override recorded (external encoder)");
    }
}

/// Synthetic capture back-end for tests
///
/// Pushes dummy RTP either on timers (when intervals are set) or on demand
/// through [`pump_video`](Self::pump_video)/[`pump_audio`](Self::pump_audio).
/// A bus error can be injected to exercise the fatal path.
pub struct SyntheticSource {
    video_interval: Option<Duration>,
    audio_interval: Option<Duration>,
    control: Arc<SyntheticEncoderControl>,
    state: Mutex<SyntheticState>,
    started: AtomicBool,
}

#[derive(Default)]
struct SyntheticState {
    inputs: Option<(TeeInput, TeeInput)>,
    events: Option<mpsc::UnboundedSender<GraphEvent>>,
    tasks: Vec<JoinHandle<()>>,
    shutdown_tx: Option<watch::Sender<bool>>,
    video_seq: u16,
    audio_seq: u16,
}

impl SyntheticSource {
    /// Source producing packets only via the manual pump methods
    pub fn manual() -> Arc<Self> {
        Arc::new(Self {
            video_interval: None,
            audio_interval: None,
            control: Arc::new(SyntheticEncoderControl::new(true)),
            state: Mutex::new(SyntheticState::default()),
            started: AtomicBool::new(false),
        })
    }

    /// Source producing packets on timers (30 fps video, 50 Hz audio pacing)
    pub fn paced() -> Arc<Self> {
        Arc::new(Self {
            video_interval: Some(Duration::from_millis(33)),
            audio_interval: Some(Duration::from_millis(20)),
            control: Arc::new(SyntheticEncoderControl::new(true)),
            state: Mutex::new(SyntheticState::default()),
            started: AtomicBool::new(false),
        })
    }

    /// Source whose encoder refuses explicit key-unit requests
    pub fn with_stubborn_encoder() -> Arc<Self> {
        Arc::new(Self {
            video_interval: None,
            audio_interval: None,
            control: Arc::new(SyntheticEncoderControl::new(false)),
            state: Mutex::new(SyntheticState::default()),
            started: AtomicBool::new(false),
        })
    }

    /// Scripted encoder control, for asserting on keyframe requests
    pub fn control(&self) -> Arc<SyntheticEncoderControl> {
        Arc::clone(&self.control)
    }

    /// Whether the source has been started and not yet stopped
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Push `n` video packets immediately
    pub async fn pump_video(&self, n: usize) {
        let mut state = self.state.lock().await;
        let seq_base = state.video_seq;
        if let Some((video, _)) = state.inputs.clone() {
            for i in 0..n {
                video.push(dummy_packet(
                    VIDEO_PAYLOAD_TYPE,
                    seq_base.wrapping_add(i as u16),
                ));
            }
            state.video_seq = seq_base.wrapping_add(n as u16);
        }
    }

    /// Push `n` audio packets immediately
    pub async fn pump_audio(&self, n: usize) {
        let mut state = self.state.lock().await;
        let seq_base = state.audio_seq;
        if let Some((_, audio)) = state.inputs.clone() {
            for i in 0..n {
                audio.push(dummy_packet(
                    AUDIO_PAYLOAD_TYPE,
                    seq_base.wrapping_add(i as u16),
                ));
            }
            state.audio_seq = seq_base.wrapping_add(n as u16);
        }
    }

    /// Inject a bus-level fatal error, as a dying encoder would
    pub async fn inject_fatal(&self, message: &str) {
        let state = self.state.lock().await;
        if let Some(events) = &state.events {
            let _ = events.send(GraphEvent::Fatal(message.to_string()));
        }
    }
}

fn dummy_packet(payload_type: u8, seq: u16) -> Packet {
    Packet {
        header: Header {
            version: 2,
            marker: true,
            payload_type,
            sequence_number: seq,
            timestamp: u32::from(seq).wrapping_mul(3000),
            ssrc: u32::from(payload_type),
            ..Default::default()
        },
        payload: Bytes::from_static(&[0xAB; 24]),
    }
}

#[async_trait]
impl MediaSource for SyntheticSource {
    async fn start(
        &self,
        video: TeeInput,
        audio: TeeInput,
        events: mpsc::UnboundedSender<GraphEvent>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        if let Some(interval) = self.video_interval {
            let input = video.clone();
            let mut shutdown = shutdown_rx.clone();
            state.tasks.push(tokio::spawn(async move {
                let mut seq: u16 = 0;
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            input.push(dummy_packet(VIDEO_PAYLOAD_TYPE, seq));
                            seq = seq.wrapping_add(1);
                        }
                    }
                }
            }));
        }

        if let Some(interval) = self.audio_interval {
            let input = audio.clone();
            let mut shutdown = shutdown_rx;
            state.tasks.push(tokio::spawn(async move {
                let mut seq: u16 = 0;
                let mut ticker = tokio::time::interval(interval);
                loop {
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = ticker.tick() => {
                            input.push(dummy_packet(AUDIO_PAYLOAD_TYPE, seq));
                            seq = seq.wrapping_add(1);
                        }
                    }
                }
            }));
        }

        state.inputs = Some((video, audio));
        state.events = Some(events);
        state.shutdown_tx = Some(shutdown_tx);
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(tx) = state.shutdown_tx.take() {
            let _ = tx.send(true);
        }
        for task in state.tasks.drain(..) {
            let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
        }
        state.inputs = None;
        self.started.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn encoder_control(&self) -> Arc<dyn EncoderControl> {
        Arc::clone(&self.control) as Arc<dyn EncoderControl>
    }
}

/// Scripted encoder control recording keyframe interactions
pub struct SyntheticEncoderControl {
    accepts_key_unit: AtomicBool,
    key_unit_requests: AtomicU64,
    key_int_max: AtomicU32,
}

impl SyntheticEncoderControl {
    fn new(accepts_key_unit: bool) -> Self {
        Self {
            accepts_key_unit: AtomicBool::new(accepts_key_unit),
            key_unit_requests: AtomicU64::new(0),
            key_int_max: AtomicU32::new(VIDEO_KEY_INT_MAX),
        }
    }

    /// Number of explicit key-unit requests observed
    pub fn key_unit_requests(&self) -> u64 {
        self.key_unit_requests.load(Ordering::SeqCst)
    }
}

impl EncoderControl for SyntheticEncoderControl {
    fn request_key_unit(&self) -> bool {
        self.key_unit_requests.fetch_add(1, Ordering::SeqCst);
        self.accepts_key_unit.load(Ordering::SeqCst)
    }

    fn key_int_max(&self) -> u32 {
        self.key_int_max.load(Ordering::SeqCst)
    }

    fn set_key_int_max(&self, frames: u32) {
        self.key_int_max.store(frames, Ordering::SeqCst);
    }
}
