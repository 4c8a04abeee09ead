//! Minimal Rust wrapper over the parts of the NI-DAQmx C library the flipper uses, and the
//! [`NiPort`] implementation of the Device I/O port on top of it.
//!
//! ## Error handling
//!
//! Every DAQmx C-function returns an `int32` status which, if negative, is an error. [`daqmx_call`]
//! turns such a status into a [`DAQmxError`] carrying the extended error string. In addition to
//! the `tracing` event, driver errors are appended to `nidaqmx_error.logs` in the working
//! directory of the calling shell.
//!
//! ## Resource management
//!
//! [`NiTask`] owns a task handle and clears it on drop unless it was already cleared. A task with
//! an every-N-samples callback also owns the boxed callback context the driver points into; the
//! handle is always cleared before that context is freed.
//!
//! For the driver reference see the
//! [NI-DAQmx C Reference](https://www.ni.com/docs/en-US/bundle/ni-daqmx-c-api-ref/page/cdaqmx/help_file_title.html).

use std::ffi::CString;
use std::fs::OpenOptions;
use std::io::Write;
use std::panic::{self, AssertUnwindSafe};

use libc;
use ndarray::Array2;
use thiserror::Error;
use tracing::{debug, error};

use flipper_backend::{
    wall_clock_secs, BatchCallback, ClockMode, DevicePort, FlipperError, FlipperResult,
    GroupingMode, HardwareConfig, PortTask, SampleBuffer, TaskRole, TriggerEdge,
};

type CConstStr = *const libc::c_char;
type CCharBuf = *mut libc::c_char;
type CFloat64 = libc::c_double;
type CUint32 = libc::c_uint;
type CUint64 = libc::c_ulonglong;
type CBool32 = libc::c_uint;
type CInt32 = libc::c_int;
pub type TaskHandle = *mut libc::c_void;

type EveryNSamplesCallback =
    extern "C" fn(TaskHandle, CInt32, CUint32, *mut libc::c_void) -> CInt32;

pub const DAQMX_VAL_RISING: CInt32 = 10280;
pub const DAQMX_VAL_FALLING: CInt32 = 10171;
pub const DAQMX_VAL_VOLTS: CInt32 = 10348;
pub const DAQMX_VAL_CFG_DEFAULT: CInt32 = -1;
pub const DAQMX_VAL_FINITESAMPS: CInt32 = 10178;
pub const DAQMX_VAL_CONTSAMPS: CInt32 = 10123;
pub const DAQMX_VAL_ALLOWREGEN: CInt32 = 10097;
pub const DAQMX_VAL_DONOTALLOWREGEN: CInt32 = 10158;
pub const DAQMX_VAL_GROUPBYCHANNEL: CBool32 = 0;
pub const DAQMX_VAL_GROUPBYSCANNUMBER: CBool32 = 1;
pub const DAQMX_VAL_ACQUIRED_INTO_BUFFER: CInt32 = 1;
pub const DAQMX_VAL_WAITINFINITELY: CFloat64 = -1.0;

/// Seconds the callback waits for samples the driver already reported as acquired
const CALLBACK_READ_TIMEOUT: CFloat64 = 1.0;
/// Seconds allowed for the short zeroing sequence
const ZERO_TIMEOUT: CFloat64 = 10.0;

#[link(name = "NIDAQmx")]
extern "C" {
    fn DAQmxGetExtendedErrorInfo(errorString: CCharBuf, bufferSize: CUint32) -> CInt32;

    fn DAQmxCreateTask(taskName: CConstStr, taskHandle_ptr: &mut TaskHandle) -> CInt32;
    fn DAQmxStartTask(handle: TaskHandle) -> CInt32;
    fn DAQmxClearTask(handle: TaskHandle) -> CInt32;
    fn DAQmxWaitUntilTaskDone(handle: TaskHandle, timeToWait: CFloat64) -> CInt32;

    fn DAQmxSetWriteRegenMode(handle: TaskHandle, data: CInt32) -> CInt32;
    fn DAQmxCfgSampClkTiming(
        handle: TaskHandle,
        src: CConstStr,
        rate: CFloat64,
        activeEdge: CInt32,
        sampleMode: CInt32,
        sampsPerChan: CUint64,
    ) -> CInt32;

    fn DAQmxCreateAOVoltageChan(
        handle: TaskHandle,
        name: CConstStr,
        assigned_name: CConstStr,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;
    fn DAQmxCreateAIVoltageChan(
        handle: TaskHandle,
        name: CConstStr,
        assigned_name: CConstStr,
        terminalConfig: CInt32,
        minVal: CFloat64,
        maxVal: CFloat64,
        units: CInt32,
        customScaleName: CConstStr,
    ) -> CInt32;

    fn DAQmxWriteAnalogF64(
        handle: TaskHandle,
        seqLen: CInt32,
        autoStart: CBool32,
        timeout: CFloat64,
        dataLayout: CBool32,
        writeArray: *const CFloat64,
        sampsPerChanWritten: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;
    fn DAQmxReadAnalogF64(
        handle: TaskHandle,
        numSampsPerChan: CInt32,
        timeout: CFloat64,
        fillMode: CBool32,
        readArray: *mut CFloat64,
        arraySizeInSamps: CUint32,
        sampsPerChanRead: *mut CInt32,
        reserved: *mut CBool32,
    ) -> CInt32;

    fn DAQmxCfgDigEdgeStartTrig(
        handle: TaskHandle,
        triggerSource: CConstStr,
        triggerEdge: CInt32,
    ) -> CInt32;
    fn DAQmxCfgAnlgEdgeStartTrig(
        handle: TaskHandle,
        triggerSource: CConstStr,
        triggerSlope: CInt32,
        triggerLevel: CFloat64,
    ) -> CInt32;
    fn DAQmxSetStartTrigRetriggerable(handle: TaskHandle, data: CBool32) -> CInt32;

    fn DAQmxRegisterEveryNSamplesEvent(
        handle: TaskHandle,
        everyNsamplesEventType: CInt32,
        nSamples: CUint32,
        options: CUint32,
        callbackFunction: Option<EveryNSamplesCallback>,
        callbackData: *mut libc::c_void,
    ) -> CInt32;
}

#[derive(Error, Debug, Clone)]
#[error("DAQmx error {code}: {msg}")]
pub struct DAQmxError {
    pub code: i32,
    pub msg: String,
}

impl DAQmxError {
    pub fn new(msg: String) -> Self {
        Self { code: 0, msg }
    }
}

impl From<DAQmxError> for FlipperError {
    fn from(value: DAQmxError) -> Self {
        FlipperError::DeviceIo(value.to_string())
    }
}

/// Calls a DAQmx C-function and converts a negative status into a [`DAQmxError`].
///
/// # Parameters
///
/// * `func`: closure wrapping a single driver call and returning its `int32` status.
///
/// # Behavior
///
/// A non-negative status is success. On a negative status the extended error info is fetched
/// with `DAQmxGetExtendedErrorInfo`, logged at error level, and appended to
/// `nidaqmx_error.logs` in the working directory. Failing to write the log file is not an error.
///
/// # Examples
///
/// ```ignore
/// daqmx_call(|| unsafe { DAQmxStartTask(self.handle) })?;
/// ```
pub fn daqmx_call<F: FnOnce() -> CInt32>(func: F) -> Result<(), DAQmxError> {
    let err_code = func();
    if err_code >= 0 {
        return Ok(());
    }
    let mut err_buff = [0 as libc::c_char; 2048];
    unsafe {
        DAQmxGetExtendedErrorInfo(err_buff.as_mut_ptr(), 2048 as CUint32);
    }
    let error_string = unsafe { std::ffi::CStr::from_ptr(err_buff.as_ptr()) }
        .to_string_lossy()
        .into_owned();

    error!("DAQmx Error {}: {}", err_code, error_string);
    let logged = OpenOptions::new()
        .append(true)
        .create(true)
        .open("./nidaqmx_error.logs")
        .and_then(|mut file| writeln!(file, "DAQmx Error {}: {}", err_code, error_string));
    if let Err(err) = logged {
        debug!("Could not write nidaqmx_error.logs: {}", err);
    }
    Err(DAQmxError {
        code: err_code,
        msg: error_string,
    })
}

fn to_cstring(value: &str, what: &str) -> Result<CString, DAQmxError> {
    CString::new(value)
        .map_err(|_| DAQmxError::new(format!("{} {:?} contains a NUL byte", what, value)))
}

fn edge_val(edge: TriggerEdge) -> CInt32 {
    match edge {
        TriggerEdge::Rising => DAQMX_VAL_RISING,
        TriggerEdge::Falling => DAQMX_VAL_FALLING,
    }
}

// Context handed to the driver with every-N-samples registration
struct CallbackSlot {
    handle: TaskHandle,
    samp_count: usize,
    read_buf: Vec<f64>,
    callback: BatchCallback,
}

impl CallbackSlot {
    fn on_batch(&mut self) {
        let t = wall_clock_secs();
        // Drain the acquired samples so the retriggered acquisition keeps its buffer free.
        // Only timing matters here, so read errors are ignored.
        let mut nread: CInt32 = 0;
        unsafe {
            DAQmxReadAnalogF64(
                self.handle,
                self.samp_count as CInt32,
                CALLBACK_READ_TIMEOUT,
                DAQMX_VAL_GROUPBYCHANNEL,
                self.read_buf.as_mut_ptr(),
                self.read_buf.len() as CUint32,
                &mut nread as *mut CInt32,
                std::ptr::null_mut(),
            );
        }
        (self.callback)(t);
    }
}

/// Driver-invoked every-N-samples hook. `data` points at the task's [`CallbackSlot`].
extern "C" fn every_n_samples_trampoline(
    _handle: TaskHandle,
    _event_type: CInt32,
    _n_samples: CUint32,
    data: *mut libc::c_void,
) -> CInt32 {
    if data.is_null() {
        return 0;
    }
    // SAFETY: `data` is the boxed slot owned by the NiTask, which clears the task (and with it
    // the registration) before the box is dropped.
    let slot = unsafe { &mut *(data as *mut CallbackSlot) };
    // Unwinding across the FFI boundary is undefined behaviour
    let _ = panic::catch_unwind(AssertUnwindSafe(|| slot.on_batch()));
    0
}

/// An NI-DAQmx task.
///
/// Creating an instance creates the driver task; methods map one-to-one onto DAQmx C-functions.
pub struct NiTask {
    handle: TaskHandle,
    role: Option<TaskRole>,
    nchan: usize,
    cleared: bool,
    callback: Option<Box<CallbackSlot>>,
}

// SAFETY: a DAQmx task handle may be used from any thread as long as calls are not concurrent,
// which `&mut self` on every mutating method guarantees.
unsafe impl Send for NiTask {}

impl NiTask {
    pub fn new(name: &str) -> Result<Self, DAQmxError> {
        let mut taskhandle: TaskHandle = std::ptr::null_mut();
        let task_name_cstr = to_cstring(name, "task name")?;
        daqmx_call(|| unsafe { DAQmxCreateTask(task_name_cstr.as_ptr(), &mut taskhandle) })?;
        Ok(Self {
            handle: taskhandle,
            role: None,
            nchan: 0,
            cleared: false,
            callback: None,
        })
    }

    pub fn clear_task(&mut self) -> Result<(), DAQmxError> {
        if self.cleared {
            return Ok(());
        }
        self.cleared = true;
        let result = daqmx_call(|| unsafe { DAQmxClearTask(self.handle) });
        // The driver no longer references the slot
        self.callback = None;
        result
    }

    pub fn start_task(&mut self) -> Result<(), DAQmxError> {
        daqmx_call(|| unsafe { DAQmxStartTask(self.handle) })
    }

    pub fn wait_until_done(&self, timeout: f64) -> Result<(), DAQmxError> {
        daqmx_call(|| unsafe { DAQmxWaitUntilTaskDone(self.handle, timeout as CFloat64) })
    }

    pub fn set_regen(&mut self, enabled: bool) -> Result<(), DAQmxError> {
        let mode = if enabled {
            DAQMX_VAL_ALLOWREGEN
        } else {
            DAQMX_VAL_DONOTALLOWREGEN
        };
        daqmx_call(|| unsafe { DAQmxSetWriteRegenMode(self.handle, mode) })
    }

    pub fn cfg_sample_clk(
        &mut self,
        clk_src: &str,
        samp_rate: f64,
        edge: TriggerEdge,
        mode: ClockMode,
        seq_len: u64,
    ) -> Result<(), DAQmxError> {
        let src_cstring = to_cstring(clk_src, "clock source")?;
        let mode = match mode {
            ClockMode::FiniteSamps => DAQMX_VAL_FINITESAMPS,
            ClockMode::ContSamps => DAQMX_VAL_CONTSAMPS,
        };
        daqmx_call(|| unsafe {
            DAQmxCfgSampClkTiming(
                self.handle,
                src_cstring.as_ptr(),
                samp_rate as CFloat64,
                edge_val(edge),
                mode,
                seq_len as CUint64,
            )
        })
    }

    pub fn create_ao_chan(&mut self, name: &str, range: (f64, f64)) -> Result<(), DAQmxError> {
        let name_cstr = to_cstring(name, "physical channel")?;
        let assigned_name_cstr = to_cstring("", "channel name")?;
        daqmx_call(|| unsafe {
            DAQmxCreateAOVoltageChan(
                self.handle,
                name_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                range.0,
                range.1,
                DAQMX_VAL_VOLTS,
                std::ptr::null(),
            )
        })?;
        self.nchan += 1;
        Ok(())
    }

    pub fn create_ai_chan(&mut self, name: &str, range: (f64, f64)) -> Result<(), DAQmxError> {
        let name_cstr = to_cstring(name, "physical channel")?;
        let assigned_name_cstr = to_cstring("", "channel name")?;
        daqmx_call(|| unsafe {
            DAQmxCreateAIVoltageChan(
                self.handle,
                name_cstr.as_ptr(),
                assigned_name_cstr.as_ptr(),
                DAQMX_VAL_CFG_DEFAULT,
                range.0,
                range.1,
                DAQMX_VAL_VOLTS,
                std::ptr::null(),
            )
        })?;
        self.nchan += 1;
        Ok(())
    }

    /// `samps` holds `nchan * samps_per_chan` values laid out according to `grouping`.
    pub fn write_analog(
        &mut self,
        samps: &[f64],
        samps_per_chan: usize,
        grouping: GroupingMode,
    ) -> Result<usize, DAQmxError> {
        let layout = match grouping {
            GroupingMode::ByChannel => DAQMX_VAL_GROUPBYCHANNEL,
            GroupingMode::ByScanNumber => DAQMX_VAL_GROUPBYSCANNUMBER,
        };
        let mut nwritten: CInt32 = 0;
        daqmx_call(|| unsafe {
            DAQmxWriteAnalogF64(
                self.handle,
                samps_per_chan as CInt32,
                false as CBool32,
                DAQMX_VAL_WAITINFINITELY,
                layout,
                samps.as_ptr(),
                &mut nwritten as *mut CInt32,
                std::ptr::null_mut(),
            )
        })?;
        Ok(nwritten as usize)
    }

    pub fn cfg_dig_edge_start_trigger(
        &mut self,
        trigger_source: &str,
        edge: TriggerEdge,
    ) -> Result<(), DAQmxError> {
        let trigger_source_cstr = to_cstring(trigger_source, "trigger source")?;
        daqmx_call(|| unsafe {
            DAQmxCfgDigEdgeStartTrig(self.handle, trigger_source_cstr.as_ptr(), edge_val(edge))
        })
    }

    pub fn cfg_anlg_edge_start_trigger(
        &mut self,
        trigger_source: &str,
        edge: TriggerEdge,
        level: f64,
    ) -> Result<(), DAQmxError> {
        let trigger_source_cstr = to_cstring(trigger_source, "trigger source")?;
        daqmx_call(|| unsafe {
            DAQmxCfgAnlgEdgeStartTrig(
                self.handle,
                trigger_source_cstr.as_ptr(),
                edge_val(edge),
                level as CFloat64,
            )
        })
    }

    pub fn set_start_trig_retriggerable(&mut self, enabled: bool) -> Result<(), DAQmxError> {
        daqmx_call(|| unsafe { DAQmxSetStartTrigRetriggerable(self.handle, enabled as CBool32) })
    }

    pub fn register_every_n_samples(
        &mut self,
        samp_count: usize,
        callback: BatchCallback,
    ) -> Result<(), DAQmxError> {
        if self.callback.is_some() {
            return Err(DAQmxError::new("task already has a batch callback".to_string()));
        }
        let mut slot = Box::new(CallbackSlot {
            handle: self.handle,
            samp_count,
            read_buf: vec![0.0; samp_count * self.nchan.max(1)],
            callback,
        });
        let data = slot.as_mut() as *mut CallbackSlot as *mut libc::c_void;
        daqmx_call(|| unsafe {
            DAQmxRegisterEveryNSamplesEvent(
                self.handle,
                DAQMX_VAL_ACQUIRED_INTO_BUFFER,
                samp_count as CUint32,
                0,
                Some(every_n_samples_trampoline as EveryNSamplesCallback),
                data,
            )
        })?;
        // Moving the box keeps the heap address the driver holds
        self.callback = Some(slot);
        Ok(())
    }
}

impl Drop for NiTask {
    fn drop(&mut self) {
        if let Err(err) = self.clear_task() {
            error!("Failed to clear DAQmx task on drop: {}", err);
        }
    }
}

impl PortTask for NiTask {
    fn configure_output_channel(&mut self, id: &str, range: (f64, f64)) -> FlipperResult<()> {
        Ok(self.create_ao_chan(id, range)?)
    }

    fn configure_input_channel(&mut self, id: &str, range: (f64, f64)) -> FlipperResult<()> {
        Ok(self.create_ai_chan(id, range)?)
    }

    fn configure_clock(
        &mut self,
        rate: f64,
        edge: TriggerEdge,
        mode: ClockMode,
        samp_count: usize,
    ) -> FlipperResult<()> {
        Ok(self.cfg_sample_clk("", rate, edge, mode, samp_count as u64)?)
    }

    fn write_samples(
        &mut self,
        buffer: &SampleBuffer,
        grouping: GroupingMode,
    ) -> FlipperResult<usize> {
        let nchan = self.nchan.max(1);
        if buffer.len() % nchan != 0 {
            return Err(FlipperError::DeviceIo(format!(
                "{} samples cannot be split over {} channels",
                buffer.len(),
                nchan
            )));
        }
        Ok(self.write_analog(buffer.as_slice(), buffer.len() / nchan, grouping)?)
    }

    fn arm_retrigger(
        &mut self,
        source: &str,
        edge: TriggerEdge,
        level: Option<f64>,
    ) -> FlipperResult<()> {
        match level {
            Some(level) => self.cfg_anlg_edge_start_trigger(source, edge, level)?,
            None => self.cfg_dig_edge_start_trigger(source, edge)?,
        }
        Ok(self.set_start_trig_retriggerable(true)?)
    }

    fn set_regen_mode(&mut self, enabled: bool) -> FlipperResult<()> {
        Ok(self.set_regen(enabled)?)
    }

    fn register_batch_callback(
        &mut self,
        samp_count: usize,
        callback: BatchCallback,
    ) -> FlipperResult<()> {
        Ok(self.register_every_n_samples(samp_count, callback)?)
    }

    fn start(&mut self) -> FlipperResult<()> {
        Ok(self.start_task()?)
    }

    fn clear(&mut self) -> FlipperResult<()> {
        if let Some(role) = self.role {
            debug!("Clearing {} task", role);
        }
        Ok(self.clear_task()?)
    }
}

/// The Device I/O port of a single NI card.
pub struct NiPort {
    hw: HardwareConfig,
}

impl NiPort {
    pub fn new(hw: &HardwareConfig) -> Self {
        Self { hw: hw.clone() }
    }
}

impl DevicePort for NiPort {
    fn open_task(&self, role: TaskRole) -> FlipperResult<Box<dyn PortTask>> {
        // DAQmx task names must be unique per process; let the driver pick one
        let mut task = NiTask::new("")?;
        task.role = Some(role);
        Ok(Box::new(task))
    }

    fn zero_all_outputs(&self) -> FlipperResult<()> {
        let mut task = NiTask::new("")?;
        let channels = self.hw.output_channels();
        for chan in channels.iter() {
            task.create_ao_chan(chan, self.hw.output_range)?;
        }
        let nsamps = self.hw.zero_samples;
        task.cfg_sample_clk(
            "",
            self.hw.zero_rate,
            TriggerEdge::Rising,
            ClockMode::FiniteSamps,
            nsamps as u64,
        )?;
        let zeros = Array2::<f64>::zeros((channels.len(), nsamps));
        let samps = zeros
            .as_slice()
            .ok_or_else(|| FlipperError::DeviceIo("zero buffer is not contiguous".to_string()))?;
        task.write_analog(samps, nsamps, GroupingMode::ByChannel)?;
        task.start_task()?;
        task.wait_until_done(ZERO_TIMEOUT)?;
        task.clear_task()?;
        debug!("Zeroed {:?}", channels);
        Ok(())
    }
}
