//! Win32 debug loop
//!
//! Starts the target with `DEBUG_PROCESS` (or `DEBUG_ONLY_THIS_PROCESS`) and
//! pumps `WaitForDebugEvent` until every debugged process has exited.

use super::process::{WindowsProcess, WindowsThread};
use super::to_wide;
use crate::traits::{ContinueStatus, DebugEvent, DebugEventsHandler, DebugLoop, ExceptionInfo};
use ghost_cov_common::{Error, ModuleImage, Result, StartInfo};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use windows::core::{PCWSTR, PWSTR};
use windows::Win32::Foundation::{
    CloseHandle, DBG_CONTINUE, DBG_EXCEPTION_NOT_HANDLED, HANDLE, NTSTATUS,
};
use windows::Win32::Storage::FileSystem::{GetFinalPathNameByHandleW, FILE_NAME_NORMALIZED};
use windows::Win32::System::Diagnostics::Debug::{
    ContinueDebugEvent, WaitForDebugEvent, CREATE_PROCESS_DEBUG_EVENT, CREATE_THREAD_DEBUG_EVENT,
    DEBUG_EVENT, EXCEPTION_DEBUG_EVENT, EXIT_PROCESS_DEBUG_EVENT, EXIT_THREAD_DEBUG_EVENT,
    LOAD_DLL_DEBUG_EVENT, UNLOAD_DLL_DEBUG_EVENT,
};
use windows::Win32::System::Threading::{
    CreateProcessW, DEBUG_ONLY_THIS_PROCESS, DEBUG_PROCESS, INFINITE, PROCESS_INFORMATION,
    STARTUPINFOW,
};

const PATH_BUFFER_SIZE: usize = 1024;

/// Handles returned by `CreateProcessW`; the debug events carry their own
struct LaunchedProcess {
    info: PROCESS_INFORMATION,
}

impl Drop for LaunchedProcess {
    fn drop(&mut self) {
        unsafe {
            if !self.info.hThread.is_invalid() {
                let _ = CloseHandle(self.info.hThread);
            }
            if !self.info.hProcess.is_invalid() {
                let _ = CloseHandle(self.info.hProcess);
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct Debugger {
    cover_children: bool,
}

/// Book-keeping for one `debug` call
#[derive(Default)]
struct Session {
    processes: HashMap<u32, WindowsProcess>,
    /// thread id -> (process id, handle)
    threads: HashMap<u32, (u32, HANDLE)>,
    root_pid: u32,
    root_program: PathBuf,
    root_exit_code: Option<i32>,
}

impl Debugger {
    pub fn new(cover_children: bool) -> Self {
        Self { cover_children }
    }

    fn launch(&self, start_info: &StartInfo) -> Result<LaunchedProcess> {
        if !start_info.program.exists() {
            return Err(Error::ProcessLaunch(format!(
                "Executable not found: {}",
                start_info.program.display()
            )));
        }

        let mut command_line = to_wide(OsStr::new(&start_info.command_line()));
        let working_directory = start_info
            .working_directory
            .as_ref()
            .map(|dir| to_wide(dir.as_os_str()));

        let creation_flags = if self.cover_children {
            DEBUG_PROCESS
        } else {
            DEBUG_ONLY_THIS_PROCESS
        };

        let startup_info = STARTUPINFOW {
            cb: std::mem::size_of::<STARTUPINFOW>() as u32,
            ..Default::default()
        };
        let mut process_info = PROCESS_INFORMATION::default();

        unsafe {
            CreateProcessW(
                PCWSTR::null(),
                PWSTR(command_line.as_mut_ptr()),
                None,
                None,
                false,
                creation_flags,
                None,
                working_directory
                    .as_ref()
                    .map(|v| PCWSTR(v.as_ptr()))
                    .unwrap_or(PCWSTR::null()),
                &startup_info,
                &mut process_info,
            )
        }
        .map_err(|e| Error::ProcessLaunch(format!("CreateProcessW failed: {}", e)))?;

        tracing::info!(target: "ghost_cov_core::win32::debugger",
            pid = process_info.dwProcessId,
            command_line = %start_info.command_line(),
            "Started process under debugger");

        Ok(LaunchedProcess { info: process_info })
    }
}

impl DebugLoop for Debugger {
    fn debug(
        &mut self,
        start_info: &StartInfo,
        handler: &mut dyn DebugEventsHandler,
    ) -> Result<i32> {
        let launched = self.launch(start_info)?;
        let mut session = Session {
            root_pid: launched.info.dwProcessId,
            root_program: start_info.program.clone(),
            ..Default::default()
        };

        loop {
            let mut event = DEBUG_EVENT::default();
            unsafe { WaitForDebugEvent(&mut event, INFINITE) }
                .map_err(|e| Error::DebugLoop(format!("WaitForDebugEvent failed: {}", e)))?;

            let status = session.dispatch(&event, handler)?;
            let exited = event.dwDebugEventCode == EXIT_PROCESS_DEBUG_EVENT;

            unsafe { ContinueDebugEvent(event.dwProcessId, event.dwThreadId, status) }
                .map_err(|e| Error::DebugLoop(format!("ContinueDebugEvent failed: {}", e)))?;

            if exited && session.processes.is_empty() {
                break;
            }
        }

        drop(launched);
        session
            .root_exit_code
            .ok_or_else(|| Error::DebugLoop("Root process exit was not observed".into()))
    }
}

impl Session {
    fn dispatch(
        &mut self,
        event: &DEBUG_EVENT,
        handler: &mut dyn DebugEventsHandler,
    ) -> Result<NTSTATUS> {
        let pid = event.dwProcessId;
        let tid = event.dwThreadId;

        let status = match event.dwDebugEventCode {
            CREATE_PROCESS_DEBUG_EVENT => {
                let info = unsafe { event.u.CreateProcessInfo };
                let path = take_image_path(info.hFile)
                    .or_else(|| (pid == self.root_pid).then(|| self.root_program.clone()))
                    .unwrap_or_else(|| PathBuf::from(format!("<process {}>", pid)));

                let mut process = WindowsProcess::new(pid, info.hProcess);
                let image = image_of(&process, path, info.lpBaseOfImage as u64);
                process.set_bitness(image.bitness);
                self.threads.insert(tid, (pid, info.hThread));

                let process = &*self.processes.entry(pid).or_insert(process);
                handler.on_event(DebugEvent::ProcessCreated { process, image })?
            }
            CREATE_THREAD_DEBUG_EVENT => {
                let info = unsafe { event.u.CreateThread };
                self.threads.insert(tid, (pid, info.hThread));
                ContinueStatus::Continue
            }
            EXIT_THREAD_DEBUG_EVENT => {
                self.threads.remove(&tid);
                ContinueStatus::Continue
            }
            LOAD_DLL_DEBUG_EVENT => {
                let info = unsafe { event.u.LoadDll };
                let path = take_image_path(info.hFile);
                match (path, self.processes.get(&pid)) {
                    (Some(path), Some(process)) => {
                        let image = image_of(process, path, info.lpBaseOfDll as u64);
                        handler.on_event(DebugEvent::ModuleLoaded { process, image })?
                    }
                    _ => ContinueStatus::Continue,
                }
            }
            UNLOAD_DLL_DEBUG_EVENT => {
                let info = unsafe { event.u.UnloadDll };
                match self.processes.get(&pid) {
                    Some(process) => handler.on_event(DebugEvent::ModuleUnloaded {
                        process,
                        base: info.lpBaseOfDll as u64,
                    })?,
                    None => ContinueStatus::Continue,
                }
            }
            EXIT_PROCESS_DEBUG_EVENT => {
                let exit_code = unsafe { event.u.ExitProcess.dwExitCode } as i32;
                if pid == self.root_pid {
                    self.root_exit_code = Some(exit_code);
                }

                let status = match self.processes.get(&pid) {
                    Some(process) => {
                        handler.on_event(DebugEvent::ProcessExited { process, exit_code })?
                    }
                    None => ContinueStatus::Continue,
                };
                self.processes.remove(&pid);
                self.threads.retain(|_, (owner, _)| *owner != pid);

                tracing::debug!(target: "ghost_cov_core::win32::debugger",
                    pid,
                    exit_code,
                    remaining = self.processes.len(),
                    "Process exited");
                status
            }
            EXCEPTION_DEBUG_EVENT => {
                let info = unsafe { event.u.Exception };
                let exception = ExceptionInfo {
                    code: info.ExceptionRecord.ExceptionCode.0 as u32,
                    address: info.ExceptionRecord.ExceptionAddress as u64,
                    first_chance: info.dwFirstChance != 0,
                };

                match (self.processes.get(&pid), self.threads.get(&tid)) {
                    (Some(process), Some((_, handle))) => {
                        let thread = WindowsThread::new(*handle, process.is_wow64());
                        handler.on_event(DebugEvent::ExceptionRaised {
                            process,
                            thread: &thread,
                            exception,
                        })?
                    }
                    _ => {
                        tracing::warn!(target: "ghost_cov_core::win32::debugger",
                            pid,
                            tid,
                            code = format!("0x{:08x}", exception.code),
                            "Exception from an unknown thread");
                        ContinueStatus::ExceptionNotHandled
                    }
                }
            }
            _ => ContinueStatus::Continue,
        };

        Ok(match status {
            ContinueStatus::Continue => DBG_CONTINUE,
            ContinueStatus::ExceptionNotHandled => DBG_EXCEPTION_NOT_HANDLED,
        })
    }
}

/// Resolve the path of an image file handle, then close the handle
fn take_image_path(file: HANDLE) -> Option<PathBuf> {
    if file.is_invalid() {
        return None;
    }

    let path = final_path_name(file);
    unsafe {
        let _ = CloseHandle(file);
    }
    path
}

fn final_path_name(file: HANDLE) -> Option<PathBuf> {
    let mut buffer = vec![0u16; PATH_BUFFER_SIZE];
    loop {
        let len = unsafe { GetFinalPathNameByHandleW(file, &mut buffer, FILE_NAME_NORMALIZED) }
            as usize;
        if len == 0 {
            return None;
        }
        if len < buffer.len() {
            let path = String::from_utf16_lossy(&buffer[..len]);
            return Some(PathBuf::from(strip_verbatim_prefix(&path)));
        }
        // Too small: len is the required size including the terminator
        buffer.resize(len + 1, 0);
    }
}

fn strip_verbatim_prefix(path: &str) -> String {
    if let Some(rest) = path.strip_prefix(r"\\?\UNC\") {
        format!(r"\\{}", rest)
    } else if let Some(rest) = path.strip_prefix(r"\\?\") {
        rest.to_string()
    } else {
        path.to_string()
    }
}

/// Describe the image mapped at `base`
///
/// Unreadable headers leave the size at zero and assume the process bitness;
/// symbol loading then decides whether the module can be covered.
fn image_of(process: &WindowsProcess, path: PathBuf, base: u64) -> ModuleImage {
    let (size, bitness) = process.image_layout(base).unwrap_or_else(|e| {
        tracing::warn!(target: "ghost_cov_core::win32::debugger",
            pid = process.pid(),
            module = %path.display(),
            error = %e,
            "Cannot read image headers");
        (0, process.bitness())
    });

    ModuleImage {
        path: path.to_string_lossy().into_owned(),
        base,
        size,
        bitness,
    }
}
