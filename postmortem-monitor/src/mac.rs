//! The Mach exception-port mechanism.
//!
//! A dedicated watcher thread owns a receive right and blocks on `mach_msg`;
//! the kernel stops the faulting thread before sending the exception message,
//! so unlike the signal path there is no register state to rescue from a
//! `ucontext` — the watcher reads it directly from the suspended thread.
//! `SIGABRT` has no Mach equivalent and stays a signal handler that forwards
//! into the same message loop.

mod ffi;
mod signal;

use crate::{Error, FaultSink, MonitorOptions, Signal};
use ffi::*;
use postmortem_context::{CrashContext, THREAD_FAULTING, THREAD_STATE_VALID};
use std::{
    cell::UnsafeCell,
    mem,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

#[repr(u32)]
enum MessageIds {
    /// A synthesized fault reported from the abort hook or `simulate`
    SignalCrash = 0,
    /// Tells the watcher to exit its message loop
    Shutdown = 2,
    /// From mach_exc in /usr/include/mach/exc.defs
    Exception = 2405,
}

/// The exceptions we register for, with the ~equivalent signal noted
const EXCEPTION_MASK: et::exception_mask_t = et::EXC_MASK_BAD_ACCESS // SIGSEGV/SIGBUS
    | et::EXC_MASK_BAD_INSTRUCTION // SIGILL
    | et::EXC_MASK_ARITHMETIC // SIGFPE
    | et::EXC_MASK_BREAKPOINT // SIGTRAP
    | et::EXC_MASK_CRASH;

struct PreviousPort {
    mask: et::exception_mask_t,
    port: mach_port_t,
    behavior: et::exception_behavior_t,
    flavor: ts::thread_state_flavor_t,
}

struct WatcherState {
    handler_port: mach_port_t,
    watcher: Option<std::thread::JoinHandle<()>>,
    previous_abort_action: Option<libc::sigaction>,
    previous: Vec<PreviousPort>,
}

static WATCHER: parking_lot::Mutex<Option<WatcherState>> = parking_lot::const_mutex(None);

static IN_FLIGHT: AtomicBool = AtomicBool::new(false);
static SINK: AtomicUsize = AtomicUsize::new(0);

struct ContextBuffer(UnsafeCell<CrashContext>);

// SAFETY: exclusively owned by whoever wins the in-flight guard
unsafe impl Sync for ContextBuffer {}

static CRASH_CONTEXT: ContextBuffer = ContextBuffer(UnsafeCell::new(unsafe { mem::zeroed() }));

#[inline]
fn kern_ret(func: impl FnOnce() -> kern_return_t) -> Result<(), Error> {
    let res = func();
    if res == KERN_SUCCESS {
        Ok(())
    } else {
        Err(std::io::Error::from_raw_os_error(res).into())
    }
}

pub(crate) fn attach(options: &MonitorOptions, sink: FaultSink) -> Result<(), Error> {
    let mut lock = WATCHER.lock();
    if lock.is_some() {
        return Err(Error::AlreadyAttached);
    }

    SINK.store(sink as usize, Ordering::Release);

    // SAFETY: this is basically just a lot of syscalls we're doing
    unsafe {
        let current_task = mach_task_self();

        let mut handler_port = MACH_PORT_NULL;
        kern_ret(|| {
            mp::mach_port_allocate(
                current_task,
                port::MACH_PORT_RIGHT_RECEIVE,
                &mut handler_port,
            )
        })?;

        if let Err(err) = kern_ret(|| {
            mp::mach_port_insert_right(
                current_task,
                handler_port,
                handler_port,
                msg::MACH_MSG_TYPE_MAKE_SEND,
            )
        }) {
            mp::mach_port_deallocate(current_task, handler_port);
            return Err(err);
        }

        // SIGABRT can't arrive on the port; intercept it only if asked for
        let previous_abort_action = if options.signals.contains(&Signal::Abort) {
            Some(signal::install_abort_handler()?)
        } else {
            None
        };

        let mut count = EXC_TYPES_COUNT as u32;
        let mut masks = [0; EXC_TYPES_COUNT];
        let mut ports = [0; EXC_TYPES_COUNT];
        let mut behaviors = [0; EXC_TYPES_COUNT];
        let mut flavors = [0; EXC_TYPES_COUNT];

        // MACH_EXCEPTION_CODES gets us 64-bit code/subcode, without which
        // EXC_BAD_ACCESS loses the faulting address
        let behavior = et::EXCEPTION_DEFAULT | et::MACH_EXCEPTION_CODES;

        kern_ret(|| {
            task_swap_exception_ports(
                current_task,
                EXCEPTION_MASK,
                handler_port,
                behavior as _,
                THREAD_STATE_NONE,
                masks.as_mut_ptr(),
                &mut count,
                ports.as_mut_ptr(),
                behaviors.as_mut_ptr(),
                flavors.as_mut_ptr(),
            )
        })?;

        let previous = (0..count as usize)
            .map(|i| PreviousPort {
                mask: masks[i],
                port: ports[i],
                behavior: behaviors[i],
                flavor: flavors[i],
            })
            .collect();

        let port = handler_port;
        let watcher = std::thread::Builder::new()
            .name("postmortem-exception-watcher".into())
            .spawn(move || message_loop(port))?;

        *lock = Some(WatcherState {
            handler_port,
            watcher: Some(watcher),
            previous_abort_action,
            previous,
        });
    }

    Ok(())
}

pub(crate) fn detach(is_watcher_thread: bool) {
    let mut lock = WATCHER.lock();
    if let Some(mut state) = lock.take() {
        // SAFETY: syscalls
        unsafe {
            restore_previous(&state);

            let mut shutdown: UserMessage = mem::zeroed();
            shutdown.header.msgh_id = MessageIds::Shutdown as i32;
            if send_user_message(state.handler_port, shutdown) {
                if let Some(watcher) = state.watcher.take() {
                    if !is_watcher_thread {
                        let _res = watcher.join();
                    }
                }
            }

            mp::mach_port_deallocate(mach_task_self(), state.handler_port);
        }
    }
    SINK.store(0, Ordering::Release);
}

/// Restores the previously registered exception ports and abort handler.
///
/// SAFETY: syscalls
unsafe fn restore_previous(state: &WatcherState) {
    if let Some(prev) = state.previous_abort_action {
        signal::restore_abort_handler(prev);
    }

    let current_task = mach_task_self();
    for pp in &state.previous {
        let _res = kern_ret(|| {
            task_set_exception_ports(current_task, pp.mask, pp.port, pp.behavior, pp.flavor)
        });
    }
}

/// A synthesized crash notification, sent to the watcher from the abort
/// signal handler or from `simulate`
#[repr(C)]
struct UserMessage {
    header: msg::mach_msg_header_t,
    body: msg::mach_msg_body_t,
    crash_thread: msg::mach_msg_port_descriptor_t,
    exception_kind: u32,
    has_exception: u32,
    exception_code: u64,
    exception_subcode: u64,
}

/// SAFETY: syscall; the message must be fully initialized
unsafe fn send_user_message(port: mach_port_t, mut message: UserMessage) -> bool {
    message.header.msgh_size = mem::size_of::<UserMessage>() as u32;
    message.header.msgh_remote_port = port;

    msg::mach_msg(
        &mut message.header,
        msg::MACH_SEND_MSG,
        message.header.msgh_size,
        0,
        0,
        msg::MACH_MSG_TIMEOUT_NONE,
        MACH_PORT_NULL,
    ) == KERN_SUCCESS
}

/// Reports a synthesized exception to the watcher from the current thread.
pub(crate) fn report_synthesized(kind: u32, code: u64, subcode: Option<u64>) -> bool {
    let lock = WATCHER.lock();
    let Some(state) = &*lock else {
        return false;
    };

    // SAFETY: POD message construction + syscalls
    unsafe {
        let message = UserMessage {
            header: msg::mach_msg_header_t {
                msgh_bits: msg::MACH_MSG_TYPE_COPY_SEND | msg::MACH_MSGH_BITS_COMPLEX,
                msgh_size: mem::size_of::<UserMessage>() as u32,
                msgh_remote_port: port::MACH_PORT_NULL,
                msgh_local_port: port::MACH_PORT_NULL,
                msgh_voucher_port: port::MACH_PORT_NULL,
                msgh_id: MessageIds::SignalCrash as i32,
            },
            body: msg::mach_msg_body_t {
                msgh_descriptor_count: 1,
            },
            crash_thread: msg::mach_msg_port_descriptor_t::new(
                mach_thread_self(),
                msg::MACH_MSG_TYPE_COPY_SEND,
            ),
            exception_kind: kind,
            has_exception: u32::from(kind != 0),
            exception_code: code,
            exception_subcode: subcode.unwrap_or_default(),
        };

        send_user_message(state.handler_port, message)
    }
}

pub(crate) fn is_attached() -> bool {
    WATCHER.lock().is_some()
}

pub(crate) fn simulate(signal: Signal) -> bool {
    let (kind, code, subcode) = match signal {
        Signal::Abort => (et::EXC_SOFTWARE as u32, EXC_SOFT_SIGNAL, Some(signal as i32 as u64)),
        _ => (0, 0, None),
    };
    report_synthesized(kind, code, subcode)
}

/// Maps a Mach exception kind onto the closest Unix signal.
fn signal_equivalent(kind: u32, code: u64, subcode: u64) -> i32 {
    match kind as et::exception_type_t {
        et::EXC_BAD_ACCESS => libc::SIGSEGV,
        et::EXC_BAD_INSTRUCTION => libc::SIGILL,
        et::EXC_ARITHMETIC => libc::SIGFPE,
        et::EXC_BREAKPOINT => libc::SIGTRAP,
        et::EXC_SOFTWARE if code == EXC_SOFT_SIGNAL => subcode as i32,
        et::EXC_CRASH => libc::SIGABRT,
        _ => 0,
    }
}

/// Stages the context for a crash on `thread` and runs the sink, all while
/// the task's other threads are suspended.
///
/// SAFETY: must run on the watcher thread with `thread` stopped
unsafe fn run_pipeline(thread: mt::thread_t, kind: u32, code: u64, subcode: u64, has_exc: bool) {
    if IN_FLIGHT
        .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
        .is_err()
    {
        return;
    }

    let _suspend = ScopedSuspend::new();

    let ctx = &mut *CRASH_CONTEXT.0.get();
    ctx.reset();

    ctx.fault.signo = signal_equivalent(kind, code, subcode);
    ctx.fault.has_exception = u32::from(has_exc);
    ctx.fault.exc_kind = kind;
    ctx.fault.exc_code = code;
    ctx.fault.exc_subcode = subcode;
    if kind as et::exception_type_t == et::EXC_BAD_ACCESS {
        // For EXC_BAD_ACCESS the subcode is the referenced address
        ctx.fault.addr = subcode;
    }
    ctx.pid = std::process::id();
    ctx.fault_tid = thread;
    ctx.timestamp = wall_clock_seconds();

    if let Some(record) = ctx.push_thread() {
        record.tid = thread;
        record.flags |= THREAD_FAULTING;
        if postmortem_context::fill_state_for_thread(thread, &mut record.state) {
            record.flags |= THREAD_STATE_VALID;
        }
    }

    let sink = SINK.load(Ordering::Acquire);
    if sink != 0 {
        let sink: FaultSink = mem::transmute(sink);
        sink(ctx);
    }
}

fn wall_clock_seconds() -> u64 {
    // SAFETY: syscall
    unsafe {
        let mut ts: libc::timespec = mem::zeroed();
        libc::clock_gettime(libc::CLOCK_REALTIME, &mut ts);
        ts.tv_sec as u64
    }
}

/// The watcher thread. Blocks on the port for kernel exception messages and
/// our own synthesized ones.
fn message_loop(port: mach_port_t) {
    // SAFETY: the message buffer outlives every mach_msg call that uses it
    unsafe {
        let mut request: ExceptionMessage = mem::zeroed();

        loop {
            request.header.msgh_local_port = port;
            request.header.msgh_size = mem::size_of::<ExceptionMessage>() as u32;

            let kret = msg::mach_msg(
                &mut request.header,
                msg::MACH_RCV_MSG | msg::MACH_RCV_LARGE,
                0,
                mem::size_of::<ExceptionMessage>() as u32,
                port,
                msg::MACH_MSG_TIMEOUT_NONE,
                MACH_PORT_NULL,
            );
            if kret != KERN_SUCCESS {
                // The port died under us; nothing to service anymore
                return;
            }

            match request.header.msgh_id as u32 {
                id if id == MessageIds::Exception as u32 => {
                    // A forked child inherits the port registration; only
                    // handle exceptions raised by this task and let the
                    // kernel move on to the host handler for anyone else
                    if request.task.name == mach_task_self() {
                        let subcode = if request.code_count > 1 {
                            request.code[1] as u64
                        } else {
                            0
                        };
                        run_pipeline(
                            request.thread.name,
                            request.exception as u32,
                            request.code[0] as u64,
                            subcode,
                            true,
                        );

                        // The report is written; put the previous ports back
                        // so the failure reply terminates through them
                        detach(true);
                    }

                    // Reply per the MIG convention; KERN_FAILURE tells the
                    // kernel we did not fix the fault, so the default
                    // disposition (terminate) proceeds
                    let mut reply: ExceptionRaiseReply = mem::zeroed();
                    reply.header.msgh_bits =
                        request.header.msgh_bits & msg::MACH_MSGH_BITS_REMOTE_MASK;
                    reply.header.msgh_size = mem::size_of::<ExceptionRaiseReply>() as u32;
                    reply.header.msgh_remote_port = request.header.msgh_remote_port;
                    reply.header.msgh_local_port = MACH_PORT_NULL;
                    reply.header.msgh_id = request.header.msgh_id + 100;
                    reply.ndr = NDR_record;
                    reply.ret_code = KERN_FAILURE;

                    msg::mach_msg(
                        &mut reply.header,
                        msg::MACH_SEND_MSG,
                        mem::size_of::<ExceptionRaiseReply>() as u32,
                        0,
                        MACH_PORT_NULL,
                        msg::MACH_MSG_TIMEOUT_NONE,
                        MACH_PORT_NULL,
                    );
                }
                id if id == MessageIds::SignalCrash as u32 => {
                    let user: &UserMessage = &*(&request as *const ExceptionMessage).cast();
                    run_pipeline(
                        user.crash_thread.name,
                        user.exception_kind,
                        user.exception_code,
                        user.exception_subcode,
                        user.has_exception != 0,
                    );

                    if user.exception_kind != 0 {
                        // A real abort is fatal: restore and let it run its
                        // course. A simulated fault returns to the caller.
                        detach(true);
                    } else {
                        IN_FLIGHT.store(false, Ordering::Release);
                    }
                }
                id if id == MessageIds::Shutdown as u32 => return,
                _ => {}
            }
        }
    }
}

/// Suspends every other thread in the task for the lifetime of the value, so
/// reading their state doesn't race the owners.
struct ScopedSuspend;

impl ScopedSuspend {
    fn new() -> Self {
        Self::for_each(|thread| {
            // Best effort; an unsuspendable thread is captured racily
            // SAFETY: syscall
            unsafe {
                mach2::thread_act::thread_suspend(thread);
            }
        });
        Self
    }

    fn for_each(op: impl Fn(mt::thread_t)) {
        // SAFETY: syscalls
        unsafe {
            let mut threads = std::ptr::null_mut();
            let mut count = 0;
            if task::task_threads(mach_task_self(), &mut threads, &mut count) != KERN_SUCCESS {
                return;
            }

            let me = mach_thread_self();
            for &thread in std::slice::from_raw_parts(threads, count as usize) {
                if thread != me {
                    op(thread);
                }
            }
        }
    }
}

impl Drop for ScopedSuspend {
    fn drop(&mut self) {
        Self::for_each(|thread| {
            // SAFETY: syscall
            unsafe {
                mach2::thread_act::thread_resume(thread);
            }
        });
    }
}
