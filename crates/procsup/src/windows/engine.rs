//! `CreateProcessW` spawn engine
//!
//! Only the three standard slots are supported. Each slot gets an anonymous
//! pipe whose child end is inheritable and whose parent end is not; a slot
//! missing from the map is connected to `NUL`. The child inherits exactly
//! those three handles through an explicit handle list, whatever else in
//! this process happens to be inheritable.

use log::{debug, info, warn};
use procsup_core::{
    BackendCapabilities, ExitStatus, ProcessError, Result, SignalName,
};
use std::collections::HashMap;
use std::os::windows::ffi::OsStrExt;
use std::os::windows::io::{AsRawHandle, FromRawHandle, OwnedHandle};

use windows::Win32::Foundation::{
    HANDLE, HANDLE_FLAG_INHERIT, HANDLE_FLAGS, SetHandleInformation, WAIT_OBJECT_0,
};
use windows::Win32::Security::SECURITY_ATTRIBUTES;
use windows::Win32::Storage::FileSystem::{
    CreateFileW, FILE_ATTRIBUTE_NORMAL, FILE_GENERIC_READ, FILE_GENERIC_WRITE, FILE_SHARE_READ,
    FILE_SHARE_WRITE, OPEN_EXISTING,
};
use windows::Win32::System::Pipes::CreatePipe;
use windows::Win32::System::Threading::{
    CREATE_NEW_PROCESS_GROUP, CREATE_NO_WINDOW, CREATE_UNICODE_ENVIRONMENT, CreateProcessW,
    DeleteProcThreadAttributeList, EXTENDED_STARTUPINFO_PRESENT, GetExitCodeProcess,
    InitializeProcThreadAttributeList, LPPROC_THREAD_ATTRIBUTE_LIST,
    PROC_THREAD_ATTRIBUTE_HANDLE_LIST, PROCESS_INFORMATION, STARTF_USESTDHANDLES,
    STARTUPINFOEXW, STARTUPINFOW, TerminateProcess, UpdateProcThreadAttribute,
    WaitForSingleObject,
};
use windows::core::{PCWSTR, PWSTR};

use super::cmdline::join_wide;
use super::envblock::environment_block;
use crate::channel::{Channel, Endpoint, ReadChannel, WriteChannel};
use crate::engine::{Launch, Launched, LaunchedChannel, SpawnEngine};
use crate::request::ChildFd;

/// Exit code given to processes stopped with `TerminateProcess`
const TERMINATED_EXIT_CODE: u32 = 1;

#[derive(Debug, Default)]
pub struct WindowsEngine {
    processes: HashMap<u32, OwnedHandle>,
}

fn raw(handle: &OwnedHandle) -> HANDLE {
    HANDLE(handle.as_raw_handle() as _)
}

fn owned(handle: HANDLE) -> OwnedHandle {
    // SAFETY: the handle was just returned by the OS and is owned by nobody else
    unsafe { OwnedHandle::from_raw_handle(handle.0 as _) }
}

fn win_error(context: &str, e: windows::core::Error) -> ProcessError {
    ProcessError::Syscall(format!("{}: {}", context, e))
}

fn wide_nul(s: &std::ffi::OsStr) -> Vec<u16> {
    s.encode_wide().chain(std::iter::once(0)).collect()
}

/// Anonymous pipe; returns (read, write), both inheritable
fn inheritable_pipe() -> Result<(OwnedHandle, OwnedHandle)> {
    let attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: std::ptr::null_mut(),
        bInheritHandle: true.into(),
    };
    let mut read = HANDLE::default();
    let mut write = HANDLE::default();
    // SAFETY: out-pointers are valid locals
    let created = unsafe { CreatePipe(&mut read, &mut write, Some(&attributes as *const _), 0) };
    created.map_err(|e| win_error("CreatePipe", e))?;
    Ok((owned(read), owned(write)))
}

fn parent_only(handle: &OwnedHandle) -> Result<()> {
    // SAFETY: handle is valid for the call
    let result =
        unsafe { SetHandleInformation(raw(handle), HANDLE_FLAG_INHERIT.0, HANDLE_FLAGS(0)) };
    result.map_err(|e| win_error("SetHandleInformation", e))
}

fn open_null() -> Result<OwnedHandle> {
    let attributes = SECURITY_ATTRIBUTES {
        nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as u32,
        lpSecurityDescriptor: std::ptr::null_mut(),
        bInheritHandle: true.into(),
    };
    let name = wide_nul(std::ffi::OsStr::new("NUL"));
    // SAFETY: name is NUL-terminated and outlives the call
    let handle = unsafe {
        CreateFileW(
            PCWSTR(name.as_ptr()),
            FILE_GENERIC_READ.0 | FILE_GENERIC_WRITE.0,
            FILE_SHARE_READ | FILE_SHARE_WRITE,
            Some(&attributes as *const _),
            OPEN_EXISTING,
            FILE_ATTRIBUTE_NORMAL,
            HANDLE::default(),
        )
    }
    .map_err(|e| win_error("CreateFileW(NUL)", e))?;
    Ok(owned(handle))
}

/// Attribute list restricting inheritance to a fixed set of handles
struct InheritList {
    // usize storage keeps the opaque list pointer-aligned
    storage: Vec<usize>,
    handles: Vec<HANDLE>,
}

impl InheritList {
    fn new(handles: &[HANDLE]) -> Result<Self> {
        let mut handles = handles.to_vec();
        handles.dedup_by_key(|h| h.0 as usize);

        let mut size = 0usize;
        // SAFETY: a null list only queries the required size; that call
        // always reports ERROR_INSUFFICIENT_BUFFER
        let _ = unsafe {
            InitializeProcThreadAttributeList(LPPROC_THREAD_ATTRIBUTE_LIST::default(), 1, 0, &mut size)
        };
        let words = size.div_ceil(std::mem::size_of::<usize>());
        let mut list = Self {
            storage: vec![0usize; words.max(1)],
            handles,
        };

        // SAFETY: storage holds at least `size` bytes and outlives the list
        let initialized =
            unsafe { InitializeProcThreadAttributeList(list.raw(), 1, 0, &mut size) };
        if let Err(e) = initialized {
            // Drop must not delete a list that was never initialized
            list.storage.clear();
            return Err(win_error("InitializeProcThreadAttributeList", e));
        }

        // SAFETY: handles lives in `list` and is not touched until drop
        let updated = unsafe {
            UpdateProcThreadAttribute(
                list.raw(),
                0,
                PROC_THREAD_ATTRIBUTE_HANDLE_LIST as usize,
                Some(list.handles.as_ptr() as *const std::ffi::c_void),
                list.handles.len() * std::mem::size_of::<HANDLE>(),
                None,
                None,
            )
        };
        updated.map_err(|e| win_error("UpdateProcThreadAttribute", e))?;
        Ok(list)
    }

    fn raw(&mut self) -> LPPROC_THREAD_ATTRIBUTE_LIST {
        LPPROC_THREAD_ATTRIBUTE_LIST(self.storage.as_mut_ptr() as *mut std::ffi::c_void)
    }
}

impl Drop for InheritList {
    fn drop(&mut self) {
        if !self.storage.is_empty() {
            // SAFETY: the list was initialized in `new`
            unsafe { DeleteProcThreadAttributeList(self.raw()) };
        }
    }
}

impl WindowsEngine {
    pub fn new() -> Self {
        Self::default()
    }

    fn exit_code(&self, pid: u32) -> Result<Option<ExitStatus>> {
        let Some(process) = self.processes.get(&pid) else {
            return Ok(None);
        };
        // SAFETY: process handle is owned by the table
        if unsafe { WaitForSingleObject(raw(process), 0) } != WAIT_OBJECT_0 {
            return Ok(None);
        }
        let mut code = 0u32;
        // SAFETY: code is a valid out-pointer
        let result = unsafe { GetExitCodeProcess(raw(process), &mut code) };
        result.map_err(|e| win_error("GetExitCodeProcess", e))?;
        Ok(Some(ExitStatus::Exited(code as i32)))
    }
}

impl SpawnEngine for WindowsEngine {
    fn capabilities(&self) -> BackendCapabilities {
        BackendCapabilities::windows()
    }

    fn spawn(&mut self, launch: &Launch<'_>) -> Result<Launched> {
        let mut channels = Vec::new();
        // Child ends, closed in the parent once the process exists
        let mut child_ends: [Option<OwnedHandle>; 3] = [None, None, None];

        for (target, disposition) in launch.request.child_fd_map() {
            let slot = usize::try_from(target)
                .ok()
                .filter(|slot| *slot < 3)
                .ok_or_else(|| ProcessError::Unsupported(format!("child fd {}", target)))?;
            match disposition {
                ChildFd::Read => {
                    let (read, write) = inheritable_pipe()?;
                    parent_only(&read)?;
                    channels.push(LaunchedChannel {
                        child_fd: target,
                        channel: Channel::Reader(ReadChannel::new(Endpoint::new(read)?)),
                    });
                    child_ends[slot] = Some(write);
                }
                ChildFd::Write => {
                    let (read, write) = inheritable_pipe()?;
                    parent_only(&write)?;
                    channels.push(LaunchedChannel {
                        child_fd: target,
                        channel: Channel::Writer(WriteChannel::new(Endpoint::new(write)?)),
                    });
                    child_ends[slot] = Some(read);
                }
                ChildFd::Discard => child_ends[slot] = Some(open_null()?),
                ChildFd::Inherit(_) => {
                    return Err(ProcessError::Unsupported(
                        "descriptor pass-through".to_string(),
                    ));
                }
            }
        }
        for slot in child_ends.iter_mut().filter(|slot| slot.is_none()) {
            *slot = Some(open_null()?);
        }
        let stdio: Vec<HANDLE> = child_ends.iter().flatten().map(raw).collect();

        let application = wide_nul(launch.executable.as_os_str());
        let wide_args: Vec<Vec<u16>> = launch
            .request
            .argv()
            .iter()
            .map(|arg| arg.encode_wide().collect())
            .collect();
        let mut command_line = join_wide(wide_args.iter().map(Vec::as_slice));
        command_line.push(0);
        let environment = environment_block(launch.env);
        let cwd = launch.request.cwd().map(|dir| wide_nul(dir.as_os_str()));

        let mut inherit = InheritList::new(&stdio)?;
        let startup = STARTUPINFOEXW {
            StartupInfo: STARTUPINFOW {
                cb: std::mem::size_of::<STARTUPINFOEXW>() as u32,
                dwFlags: STARTF_USESTDHANDLES,
                hStdInput: stdio[0],
                hStdOutput: stdio[1],
                hStdError: stdio[2],
                ..Default::default()
            },
            lpAttributeList: inherit.raw(),
        };
        let mut info = PROCESS_INFORMATION::default();

        // SAFETY: every buffer is NUL-terminated and outlives the call
        let created = unsafe {
            CreateProcessW(
                PCWSTR(application.as_ptr()),
                PWSTR(command_line.as_mut_ptr()),
                None,
                None,
                true,
                CREATE_NO_WINDOW
                    | CREATE_NEW_PROCESS_GROUP
                    | CREATE_UNICODE_ENVIRONMENT
                    | EXTENDED_STARTUPINFO_PRESENT,
                Some(environment.as_ptr() as *const std::ffi::c_void),
                cwd.as_ref()
                    .map_or(PCWSTR::null(), |dir| PCWSTR(dir.as_ptr())),
                &startup.StartupInfo,
                &mut info,
            )
        };
        drop(inherit);
        if let Err(e) = created {
            warn!(
                "CreateProcessW failed for {}: {}",
                launch.executable.display(),
                e
            );
            return Err(ProcessError::Spawn(e.to_string()));
        }

        drop(owned(info.hThread));
        drop(child_ends);
        let pid = info.dwProcessId;
        self.processes.insert(pid, owned(info.hProcess));

        info!(
            "Spawned pid {} ({}) with {} channel(s)",
            pid,
            launch.executable.display(),
            channels.len()
        );
        Ok(Launched {
            pid,
            channels,
            status_pipe: None,
        })
    }

    fn signal(&mut self, pid: u32, signal: SignalName) -> Result<()> {
        if !signal.is_termination() {
            return Err(ProcessError::Unsupported(format!("{} on Windows", signal)));
        }
        if self.exit_code(pid)?.is_some() {
            return Err(ProcessError::ProcessExitedAlready);
        }
        let Some(process) = self.processes.get(&pid) else {
            return Err(ProcessError::ProcessExitedAlready);
        };
        debug!("Terminating pid {} for {}", pid, signal);
        // SAFETY: process handle is owned by the table
        let result = unsafe { TerminateProcess(raw(process), TERMINATED_EXIT_CODE) };
        result.map_err(|e| win_error("TerminateProcess", e))
    }

    fn is_alive(&mut self, pid: u32) -> bool {
        self.processes.contains_key(&pid) && matches!(self.exit_code(pid), Ok(None))
    }

    fn reap_one(&mut self, pid: u32) -> Result<Option<ExitStatus>> {
        let status = self.exit_code(pid)?;
        if status.is_some() {
            self.processes.remove(&pid);
        }
        Ok(status)
    }

    fn reap_any(&mut self) -> Result<Option<(u32, ExitStatus)>> {
        let pids: Vec<u32> = self.processes.keys().copied().collect();
        for pid in pids {
            if let Some(status) = self.reap_one(pid)? {
                return Ok(Some((pid, status)));
            }
        }
        Ok(None)
    }
}
