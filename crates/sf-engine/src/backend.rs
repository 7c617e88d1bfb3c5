//! Audio backends: the mixer-thread owners
//!
//! A backend drives the pull loop: it owns the device while running, calls
//! `Device::mix` for each update-sized chunk, and delivers the bytes to a
//! sink. Two backends ship here: a null backend that discards its output
//! (loopback pacing) and a wave-file writer producing RIFF/WAVE with a
//! `WAVE_FORMAT_EXTENSIBLE` header. Fatal sink errors flow through the
//! device's disconnect path.

use std::fs::File;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use sf_core::{ChannelLayout, SampleFormat, SfError, SfResult};

use crate::device::Device;

/// The backend contract: negotiate a format, then own the mix loop
pub trait Backend {
    /// Validate and bind the named sink
    fn open(&mut self, name: &str) -> SfResult<()>;

    /// (Re)negotiate against the device's format. The device runs its
    /// renderer initialization before `start` is allowed.
    fn reset(&mut self, device: &Device) -> SfResult<()>;

    /// Take ownership of the device and begin mixing
    fn start(&mut self, device: Device) -> SfResult<()>;

    /// Stop the mix thread and hand the device back
    fn stop(&mut self) -> Option<Device>;
}

/// Sub-format GUIDs for the extensible wave header
const SUBTYPE_PCM: [u8; 16] = [
    0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xaa, 0x00, 0x38, 0x9b,
    0x71,
];
const SUBTYPE_FLOAT: [u8; 16] = [
    0x03, 0x00, 0x00, 0x00, 0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0xaa, 0x00, 0x38, 0x9b,
    0x71,
];
const SUBTYPE_BFORMAT_PCM: [u8; 16] = [
    0x01, 0x00, 0x00, 0x00, 0x21, 0x07, 0xd3, 0x11, 0x86, 0x44, 0xc8, 0xc1, 0xca, 0x00, 0x00,
    0x00,
];
const SUBTYPE_BFORMAT_FLOAT: [u8; 16] = [
    0x03, 0x00, 0x00, 0x00, 0x21, 0x07, 0xd3, 0x11, 0x86, 0x44, 0xc8, 0xc1, 0xca, 0x00, 0x00,
    0x00,
];

/// Serialize the 40-byte extensible `fmt ` chunk and chunk scaffolding.
/// Returns where the data payload begins.
fn write_wave_header<W: Write>(w: &mut W, device: &Device) -> std::io::Result<u64> {
    let layout = device.layout();
    let fmt = device.sample_format();
    let channels = layout.count() as u16;
    let bits = (fmt.bytes_per_sample() * 8) as u16;
    let freq = device.frequency();
    let isbformat = layout.is_ambisonic();
    let chanmask = layout.wave_channel_mask();

    w.write_all(b"RIFF")?;
    w.write_all(&0xFFFF_FFFFu32.to_le_bytes())?; // RIFF length, patched at stop
    w.write_all(b"WAVE")?;

    w.write_all(b"fmt ")?;
    w.write_all(&40u32.to_le_bytes())?; // EXTENSIBLE fmt chunk length
    w.write_all(&0xFFFEu16.to_le_bytes())?; // format tag: extensible
    w.write_all(&channels.to_le_bytes())?;
    w.write_all(&freq.to_le_bytes())?;
    w.write_all(&(freq * channels as u32 * bits as u32 / 8).to_le_bytes())?;
    w.write_all(&(channels * bits / 8).to_le_bytes())?; // frame size
    w.write_all(&bits.to_le_bytes())?;
    w.write_all(&22u16.to_le_bytes())?; // extra byte count
    w.write_all(&bits.to_le_bytes())?; // valid bits per sample
    w.write_all(&chanmask.to_le_bytes())?;
    let guid = match (fmt.is_float(), isbformat) {
        (true, true) => &SUBTYPE_BFORMAT_FLOAT,
        (true, false) => &SUBTYPE_FLOAT,
        (false, true) => &SUBTYPE_BFORMAT_PCM,
        (false, false) => &SUBTYPE_PCM,
    };
    w.write_all(guid)?;

    w.write_all(b"data")?;
    w.write_all(&0xFFFF_FFFFu32.to_le_bytes())?; // data length, patched at stop

    // RIFF scaffolding (12) + fmt chunk (8 + 40) + data chunk head (8).
    Ok(12 + 8 + 40 + 8)
}

/// In-memory little-endian fixup for big-endian hosts; wave files are
/// little-endian regardless of the host byte order.
fn fix_endianness(buffer: &mut [u8], fmt: SampleFormat) {
    if cfg!(target_endian = "little") {
        return;
    }
    match fmt.bytes_per_sample() {
        2 => {
            for pair in buffer.chunks_exact_mut(2) {
                pair.swap(0, 1);
            }
        }
        4 => {
            for quad in buffer.chunks_exact_mut(4) {
                quad.swap(0, 3);
                quad.swap(1, 2);
            }
        }
        _ => {}
    }
}

/// Wave-file writer backend
pub struct WaveBackend {
    path: PathBuf,
    file: Option<File>,
    data_start: u64,
    kill: Arc<AtomicBool>,
    thread: Option<JoinHandle<(Device, File)>>,
}

impl WaveBackend {
    /// Bind to an output path. The file is created on `reset`.
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: None,
            data_start: 0,
            kill: Arc::new(AtomicBool::new(true)),
            thread: None,
        }
    }

    /// Mix `num_frames` synchronously into the file (offline rendering
    /// for tools and tests; `start` runs the same loop paced realtime).
    pub fn render(&mut self, device: &mut Device, num_frames: usize) -> SfResult<()> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| SfError::State("wave backend not reset".into()))?;
        let frame_size = device.frame_size();
        let mut buffer = vec![0u8; device.update_size * frame_size];

        let mut remaining = num_frames;
        while remaining > 0 {
            let todo = remaining.min(device.update_size);
            let done = device.mix(&mut buffer[..todo * frame_size], todo);
            if done < todo {
                buffer[done * frame_size..todo * frame_size].fill(0);
            }
            fix_endianness(&mut buffer[..todo * frame_size], device.sample_format());
            file.write_all(&buffer[..todo * frame_size])?;
            remaining -= todo;
        }
        Ok(())
    }

    fn patch_sizes(file: &mut File, data_start: u64) -> std::io::Result<()> {
        let size = file.seek(SeekFrom::End(0))?;
        if size > data_start {
            let data_len = (size - data_start) as u32;
            file.seek(SeekFrom::Start(data_start - 4))?;
            file.write_all(&data_len.to_le_bytes())?;
            file.seek(SeekFrom::Start(4))?;
            file.write_all(&((size - 8) as u32).to_le_bytes())?;
        }
        Ok(())
    }
}

impl Backend for WaveBackend {
    fn open(&mut self, name: &str) -> SfResult<()> {
        if name.is_empty() {
            return Err(SfError::InvalidDeviceName(name.into()));
        }
        Ok(())
    }

    fn reset(&mut self, device: &Device) -> SfResult<()> {
        // Unsigned 16/32-bit and signed 8-bit have no wave encoding.
        match device.sample_format() {
            SampleFormat::I8 | SampleFormat::U16 | SampleFormat::U32 => {
                return Err(SfError::UnsupportedFormat(
                    "wave output supports u8/i16/i32/f32".into(),
                ));
            }
            _ => {}
        }
        if let ChannelLayout::Ambi3D(order) = device.layout() {
            if order > 3 {
                return Err(SfError::UnsupportedFormat(
                    "wave B-Format output caps at third order".into(),
                ));
            }
        }

        let mut file = File::create(&self.path)?;
        self.data_start = write_wave_header(&mut file, device)?;
        file.flush()?;
        self.file = Some(file);
        Ok(())
    }

    fn start(&mut self, mut device: Device) -> SfResult<()> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| SfError::State("wave backend not reset".into()))?;
        self.kill.store(false, Ordering::Release);
        let kill = self.kill.clone();

        let thread = std::thread::Builder::new()
            .name("sf-wave-mixer".into())
            .spawn(move || {
                let frame_size = device.frame_size();
                let update = device.update_size;
                let freq = device.frequency() as u64;
                let mut buffer = vec![0u8; update * frame_size];
                let rest = Duration::from_millis((update as u64 * 1000 / freq / 2).max(1));

                let mut done: u64 = 0;
                let mut start = Instant::now();
                while !kill.load(Ordering::Acquire) && device.is_connected() {
                    let avail = start.elapsed().as_nanos() as u64 * freq / 1_000_000_000;
                    if avail.saturating_sub(done) < update as u64 {
                        std::thread::sleep(rest);
                        continue;
                    }
                    while avail.saturating_sub(done) >= update as u64 {
                        let written = device.mix(&mut buffer, update);
                        if written < update {
                            buffer[written * frame_size..].fill(0);
                        }
                        done += update as u64;

                        fix_endianness(&mut buffer, device.sample_format());
                        if file.write_all(&buffer).is_err() {
                            log::error!("Error writing to file");
                            device.handle_disconnect("Failed to write playback samples");
                            break;
                        }
                    }

                    // Shift whole seconds into the epoch so the counters
                    // stay small over long runs.
                    if done >= freq {
                        let secs = done / freq;
                        start += Duration::from_secs(secs);
                        done -= freq * secs;
                    }
                }
                (device, file)
            })
            .map_err(|e| SfError::Backend(format!("failed to start mixing thread: {e}")))?;

        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) -> Option<Device> {
        self.kill.store(true, Ordering::Release);
        let thread = self.thread.take()?;
        let (device, mut file) = thread.join().ok()?;
        if let Err(e) = Self::patch_sizes(&mut file, self.data_start) {
            log::error!("Error finalizing file: {e}");
        }
        self.file = Some(file);
        Some(device)
    }
}

/// Backend that mixes on schedule and discards the output
pub struct NullBackend {
    kill: Arc<AtomicBool>,
    thread: Option<JoinHandle<Device>>,
}

impl NullBackend {
    pub fn new() -> Self {
        Self {
            kill: Arc::new(AtomicBool::new(true)),
            thread: None,
        }
    }
}

impl Default for NullBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl Backend for NullBackend {
    fn open(&mut self, _name: &str) -> SfResult<()> {
        Ok(())
    }

    fn reset(&mut self, _device: &Device) -> SfResult<()> {
        Ok(())
    }

    fn start(&mut self, mut device: Device) -> SfResult<()> {
        self.kill.store(false, Ordering::Release);
        let kill = self.kill.clone();

        let thread = std::thread::Builder::new()
            .name("sf-null-mixer".into())
            .spawn(move || {
                let frame_size = device.frame_size();
                let update = device.update_size;
                let freq = device.frequency() as u64;
                let mut buffer = vec![0u8; update * frame_size];
                let rest = Duration::from_millis((update as u64 * 1000 / freq / 2).max(1));

                let mut done: u64 = 0;
                let mut start = Instant::now();
                while !kill.load(Ordering::Acquire) && device.is_connected() {
                    let avail = start.elapsed().as_nanos() as u64 * freq / 1_000_000_000;
                    if avail.saturating_sub(done) < update as u64 {
                        std::thread::sleep(rest);
                        continue;
                    }
                    while avail.saturating_sub(done) >= update as u64 {
                        device.mix(&mut buffer, update);
                        done += update as u64;
                    }
                    if done >= freq {
                        let secs = done / freq;
                        start += Duration::from_secs(secs);
                        done -= freq * secs;
                    }
                }
                device
            })
            .map_err(|e| SfError::Backend(format!("failed to start mixing thread: {e}")))?;

        self.thread = Some(thread);
        Ok(())
    }

    fn stop(&mut self) -> Option<Device> {
        self.kill.store(true, Ordering::Release);
        self.thread.take()?.join().ok()
    }
}
