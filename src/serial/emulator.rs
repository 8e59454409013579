//! In-process stand-in for the pad firmware.
//!
//! Speaks the same line protocol as the real board so the whole bridge can
//! run without hardware (`--mock-serial`), and exposes a control handle the
//! tests use to unplug, silence or confuse the device.
use std::collections::VecDeque;
use std::io::{self, ErrorKind, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::interface::{Connector, SerialInterface};
use super::protocol::{Request, Response, Tag};
use super::{Result, SerialError};

/// Largest value the 10-bit ADC can report
pub const ADC_MAX: i32 = 1023;

#[derive(Debug)]
struct EmulatorState {
    values: Vec<i32>,
    thresholds: Vec<i32>,
    jitter: bool,
    unplugged: bool,
    silent: bool,
    injected: VecDeque<String>,
    threshold_writes: usize,
    opens: usize,
}

/// Shared control over an emulated device. Cloning yields another handle to
/// the same device.
#[derive(Debug, Clone)]
pub struct EmulatorHandle {
    state: Arc<Mutex<EmulatorState>>,
}

impl EmulatorHandle {
    pub fn new(sensor_count: usize) -> Self {
        Self::with_thresholds(vec![0; sensor_count])
    }

    pub fn with_thresholds(thresholds: Vec<i32>) -> Self {
        let state = EmulatorState {
            values: vec![0; thresholds.len()],
            thresholds,
            jitter: true,
            unplugged: false,
            silent: false,
            injected: VecDeque::new(),
            threshold_writes: 0,
            opens: 0,
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    fn lock(&self) -> MutexGuard<'_, EmulatorState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn sensor_count(&self) -> usize {
        self.lock().thresholds.len()
    }

    pub fn thresholds(&self) -> Vec<i32> {
        self.lock().thresholds.clone()
    }

    /// Pin the sensor readings and stop the random walk
    pub fn set_values(&self, values: Vec<i32>) {
        let mut state = self.lock();
        state.values = values;
        state.jitter = false;
    }

    pub fn set_jitter(&self, jitter: bool) {
        self.lock().jitter = jitter;
    }

    /// Opens fail and open handles error on every read and write
    pub fn unplug(&self) {
        self.lock().unplugged = true;
    }

    pub fn replug(&self) {
        self.lock().unplugged = false;
    }

    /// Commands are still applied but nothing is answered
    pub fn set_silent(&self, silent: bool) {
        self.lock().silent = silent;
    }

    /// Answer the next command with `raw` verbatim instead of the real reply.
    /// Include the trailing newline to make it a complete line.
    pub fn inject_response(&self, raw: impl Into<String>) {
        self.lock().injected.push_back(raw.into());
    }

    /// Number of `<index> <value>` commands the device has processed
    pub fn threshold_writes(&self) -> usize {
        self.lock().threshold_writes
    }

    /// Number of successful opens
    pub fn opens(&self) -> usize {
        self.lock().opens
    }

    pub fn open(&self) -> Result<EmulatedDevice> {
        let mut state = self.lock();
        if state.unplugged {
            return Err(SerialError::ConnectionFailed("Emulated device is unplugged".into()));
        }
        state.opens += 1;
        drop(state);

        Ok(EmulatedDevice {
            handle: self.clone(),
            inbound: Vec::new(),
            outbound: VecDeque::new(),
            rng: StdRng::from_entropy(),
        })
    }
}

/// One open connection to the emulated device
pub struct EmulatedDevice {
    handle: EmulatorHandle,
    inbound: Vec<u8>,
    outbound: VecDeque<u8>,
    rng: StdRng,
}

impl EmulatedDevice {
    fn process_line(&mut self, line: &str) {
        let mut state = self.handle.lock();
        let sensor_count = state.thresholds.len();

        let response = match Request::parse(line) {
            Some(Request::Values) => {
                if state.jitter {
                    // Random walk so a plot looks alive
                    let step = sensor_count as i32 + 1;
                    for value in state.values.iter_mut() {
                        *value = (*value + self.rng.gen_range(-step..=step)).clamp(0, ADC_MAX);
                    }
                }
                Some(Response { tag: Tag::Values, values: state.values.clone() })
            }
            Some(Request::Thresholds) => Some(Response { tag: Tag::Thresholds, values: state.thresholds.clone() }),
            Some(Request::SetThreshold { index, value }) => {
                state.threshold_writes += 1;
                if index < sensor_count {
                    state.thresholds[index] = value.clamp(0, ADC_MAX);
                }
                Some(Response { tag: Tag::Thresholds, values: state.thresholds.clone() })
            }
            None => {
                log::debug!("Emulated device ignoring unknown command {:?}", line);
                None
            }
        };

        if state.silent {
            return;
        }
        if let Some(raw) = state.injected.pop_front() {
            self.outbound.extend(raw.into_bytes());
        } else if let Some(response) = response {
            self.outbound.extend(response.encode().into_bytes());
        }
    }

    fn check_plugged(&self) -> io::Result<()> {
        if self.handle.lock().unplugged {
            Err(io::Error::new(ErrorKind::BrokenPipe, "emulated device unplugged"))
        } else {
            Ok(())
        }
    }
}

impl Write for EmulatedDevice {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.check_plugged()?;
        for byte in buf {
            if *byte == b'\n' {
                let raw = std::mem::take(&mut self.inbound);
                let line = String::from_utf8_lossy(&raw).trim().to_string();
                self.process_line(&line);
            } else {
                self.inbound.push(*byte);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.check_plugged()
    }
}

impl Read for EmulatedDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_plugged()?;
        if self.outbound.is_empty() {
            return Err(io::Error::new(ErrorKind::TimedOut, "no data from emulated device"));
        }
        let n = buf.len().min(self.outbound.len());
        for (slot, byte) in buf.iter_mut().zip(self.outbound.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

/// Connector that opens the emulated device instead of a real port
pub struct EmulatorConnector {
    handle: EmulatorHandle,
    timeout: Duration,
}

impl EmulatorConnector {
    pub fn new(handle: EmulatorHandle, timeout: Duration) -> Self {
        Self { handle, timeout }
    }

    pub fn handle(&self) -> &EmulatorHandle {
        &self.handle
    }
}

#[async_trait::async_trait]
impl Connector for EmulatorConnector {
    fn describe(&self) -> String {
        format!("emulated device with {} sensors", self.handle.sensor_count())
    }

    async fn open(&self) -> Result<SerialInterface> {
        let device = self.handle.open()?;
        Ok(SerialInterface::from_io("emulator", Box::new(device), self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exchange(device: &mut EmulatedDevice, command: &str) -> String {
        device.write_all(command.as_bytes()).unwrap();
        let mut buf = [0u8; 128];
        let n = device.read(&mut buf).unwrap();
        String::from_utf8_lossy(&buf[..n]).to_string()
    }

    #[test]
    fn test_threshold_set_is_clamped_and_echoed() {
        let handle = EmulatorHandle::new(4);
        let mut device = handle.open().unwrap();

        assert_eq!(exchange(&mut device, "1 2000\n"), "t 0 1023 0 0\n");
        assert_eq!(exchange(&mut device, "2 -5\n"), "t 0 1023 0 0\n");
        assert_eq!(handle.thresholds(), vec![0, 1023, 0, 0]);
        assert_eq!(handle.threshold_writes(), 2);
    }

    #[test]
    fn test_values_stay_in_adc_range() {
        let handle = EmulatorHandle::new(3);
        let mut device = handle.open().unwrap();
        for _ in 0..200 {
            let line = exchange(&mut device, "v\n");
            let values: Vec<i32> = line.split_whitespace().skip(1).map(|v| v.parse().unwrap()).collect();
            assert_eq!(values.len(), 3);
            assert!(values.iter().all(|v| (0..=ADC_MAX).contains(v)));
        }
    }

    #[test]
    fn test_pinned_values_are_reported_verbatim() {
        let handle = EmulatorHandle::new(2);
        handle.set_values(vec![12, 900]);
        let mut device = handle.open().unwrap();
        assert_eq!(exchange(&mut device, "v\n"), "v 12 900\n");
    }

    #[test]
    fn test_unplugged_device_refuses_open_and_io() {
        let handle = EmulatorHandle::new(2);
        let mut device = handle.open().unwrap();
        handle.unplug();

        assert!(handle.open().is_err());
        assert_eq!(device.write(b"t\n").unwrap_err().kind(), ErrorKind::BrokenPipe);

        handle.replug();
        assert_eq!(exchange(&mut device, "t\n"), "t 0 0\n");
        assert_eq!(handle.opens(), 1);
    }

    #[test]
    fn test_silent_device_applies_but_does_not_answer() {
        let handle = EmulatorHandle::new(2);
        let mut device = handle.open().unwrap();
        handle.set_silent(true);

        device.write_all(b"0 77\n").unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(device.read(&mut buf).unwrap_err().kind(), ErrorKind::TimedOut);
        assert_eq!(handle.thresholds(), vec![77, 0]);
    }

    #[test]
    fn test_injected_response_replaces_reply() {
        let handle = EmulatorHandle::new(2);
        let mut device = handle.open().unwrap();
        handle.inject_response("x 1 2\n");
        assert_eq!(exchange(&mut device, "t\n"), "x 1 2\n");
        assert_eq!(exchange(&mut device, "t\n"), "t 0 0\n");
    }
}
