//! Mock transports for testing.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use super::traits::{DeviceEntry, DeviceProbe, FlashTransport};
use crate::error::{FlashError, Result};
use crate::session::DeviceMode;

/// Probe that replays scripted listings, then reports nothing.
#[derive(Clone)]
pub struct MockProbe {
    mode: DeviceMode,
    /// Listings returned by successive `list_devices` calls.
    script: Arc<Mutex<VecDeque<Vec<DeviceEntry>>>>,
    properties: Arc<Mutex<Vec<(String, String)>>>,
    list_calls: Arc<Mutex<usize>>,
    property_calls: Arc<Mutex<usize>>,
}

impl MockProbe {
    pub fn new(mode: DeviceMode) -> Self {
        Self {
            mode,
            script: Arc::new(Mutex::new(VecDeque::new())),
            properties: Arc::new(Mutex::new(Vec::new())),
            list_calls: Arc::new(Mutex::new(0)),
            property_calls: Arc::new(Mutex::new(0)),
        }
    }

    /// Queue a listing with a single device.
    pub fn push_device(&self, id: &str) {
        self.push(vec![DeviceEntry::new(id, self.mode.to_string())]);
    }

    pub fn push_empty(&self) {
        self.push(Vec::new());
    }

    pub fn push(&self, entries: Vec<DeviceEntry>) {
        self.script.lock().unwrap().push_back(entries);
    }

    pub fn set_properties(&self, properties: Vec<(String, String)>) {
        *self.properties.lock().unwrap() = properties;
    }

    pub fn list_calls(&self) -> usize {
        *self.list_calls.lock().unwrap()
    }

    pub fn property_calls(&self) -> usize {
        *self.property_calls.lock().unwrap()
    }
}

impl DeviceProbe for MockProbe {
    fn mode(&self) -> DeviceMode {
        self.mode
    }

    fn list_devices(&self) -> Vec<DeviceEntry> {
        *self.list_calls.lock().unwrap() += 1;
        self.script.lock().unwrap().pop_front().unwrap_or_default()
    }

    fn last_error(&self) -> Option<String> {
        None
    }

    fn properties(&self, _id: &str) -> Vec<(String, String)> {
        *self.property_calls.lock().unwrap() += 1;
        self.properties.lock().unwrap().clone()
    }
}

/// Scripted bootloader transport.
///
/// Flash results are scripted per partition as failure messages; anything
/// not scripted succeeds. Attachment is scripted per call and defaults to
/// attached once the script runs out.
#[derive(Clone, Default)]
pub struct MockFlashTransport {
    attached: Arc<Mutex<VecDeque<bool>>>,
    flash_failures: Arc<Mutex<HashMap<String, VecDeque<Option<String>>>>>,
    flash_log: Arc<Mutex<Vec<(String, PathBuf)>>>,
    getvar_all: Arc<Mutex<Option<std::result::Result<String, String>>>>,
    vars: Arc<Mutex<HashMap<String, String>>>,
    getvar_log: Arc<Mutex<Vec<String>>>,
    fetch_bytes: Arc<Mutex<Option<u64>>>,
}

impl MockFlashTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue attachment answers for successive `is_attached` calls.
    pub fn script_attached(&self, answers: &[bool]) {
        self.attached.lock().unwrap().extend(answers);
    }

    /// Queue one flash outcome for `partition`: `None` succeeds, `Some(msg)` fails.
    pub fn script_flash(&self, partition: &str, outcome: Option<&str>) {
        self.flash_failures
            .lock()
            .unwrap()
            .entry(partition.to_string())
            .or_default()
            .push_back(outcome.map(str::to_string));
    }

    /// Make every flash of `partition` fail.
    pub fn fail_always(&self, partition: &str, times: usize) {
        for _ in 0..times {
            self.script_flash(partition, Some("FAILED (remote: 'flash write failure')"));
        }
    }

    pub fn set_getvar_all(&self, response: std::result::Result<&str, &str>) {
        *self.getvar_all.lock().unwrap() =
            Some(response.map(str::to_string).map_err(str::to_string));
    }

    pub fn set_var(&self, name: &str, value: &str) {
        self.vars
            .lock()
            .unwrap()
            .insert(name.to_string(), value.to_string());
    }

    /// Length of the file produced by the next fetches.
    pub fn set_fetch_bytes(&self, bytes: u64) {
        *self.fetch_bytes.lock().unwrap() = Some(bytes);
    }

    pub fn flash_calls(&self) -> Vec<(String, PathBuf)> {
        self.flash_log.lock().unwrap().clone()
    }

    pub fn getvar_calls(&self) -> Vec<String> {
        self.getvar_log.lock().unwrap().clone()
    }

    fn failed(command: &str, output: String) -> FlashError {
        FlashError::CommandFailed {
            command: command.to_string(),
            code: Some(1),
            output,
        }
    }
}

impl FlashTransport for MockFlashTransport {
    fn is_attached(&self) -> bool {
        self.attached.lock().unwrap().pop_front().unwrap_or(true)
    }

    fn flash_partition(&self, partition: &str, image: &Path) -> Result<()> {
        self.flash_log
            .lock()
            .unwrap()
            .push((partition.to_string(), image.to_path_buf()));
        let outcome = self
            .flash_failures
            .lock()
            .unwrap()
            .get_mut(partition)
            .and_then(|queue| queue.pop_front())
            .flatten();
        match outcome {
            Some(message) => Err(Self::failed(&format!("fastboot flash {}", partition), message)),
            None => Ok(()),
        }
    }

    fn getvar_all(&self) -> Result<String> {
        self.getvar_log.lock().unwrap().push("all".to_string());
        match self.getvar_all.lock().unwrap().clone() {
            Some(Ok(output)) => Ok(output),
            Some(Err(message)) => Err(Self::failed("fastboot getvar all", message)),
            None => Ok(String::new()),
        }
    }

    fn getvar(&self, name: &str) -> Result<String> {
        self.getvar_log.lock().unwrap().push(name.to_string());
        self.vars.lock().unwrap().get(name).cloned().ok_or_else(|| {
            Self::failed(
                &format!("fastboot getvar {}", name),
                "FAILED (remote: 'GetVar Variable Not found')".to_string(),
            )
        })
    }

    fn fetch_partition(&self, partition: &str, out: &Path) -> Result<()> {
        let bytes = (*self.fetch_bytes.lock().unwrap()).ok_or_else(|| {
            Self::failed(&format!("fastboot fetch {}", partition), "no data".into())
        })?;
        std::fs::File::create(out)?.set_len(bytes)?;
        Ok(())
    }
}
