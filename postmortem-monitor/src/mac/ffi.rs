//! Hand-rolled bindings for the exception-port machinery that `mach2` does
//! not cover. The message layouts follow the MIG-generated code for
//! `mach_exc.defs`; each item notes the header it comes from.

pub use mach2::{
    exception_types as et,
    kern_return::{kern_return_t, KERN_FAILURE, KERN_SUCCESS},
    mach_init::mach_thread_self,
    mach_port as mp, mach_types as mt, message as msg,
    port::{self, mach_port_t, MACH_PORT_NULL},
    task, thread_status as ts,
    traps::mach_task_self,
};

/// Number of top level exception types, `<arch>/exception.h`
pub const EXC_TYPES_COUNT: usize = 14;

/// For `EXC_SOFTWARE` exceptions, indicates the exception was a Unix signal;
/// the actual signal number rides in the subcode. `exception_types.h`
pub const EXC_SOFT_SIGNAL: u64 = 0x10003;

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "x86", target_arch = "x86_64"))] {
        pub const THREAD_STATE_NONE: ts::thread_state_flavor_t = 13;
    } else if #[cfg(any(target_arch = "arm", target_arch = "aarch64"))] {
        pub const THREAD_STATE_NONE: ts::thread_state_flavor_t = 5;
    }
}

/// Network Data Representation record, `ndr.h`
#[repr(C)]
#[derive(Copy, Clone)]
pub struct NDR_record_t {
    pub mig_vers: u8,
    pub if_vers: u8,
    pub reserved1: u8,
    pub mig_encoding: u8,
    pub int_rep: u8,
    pub char_rep: u8,
    pub float_rep: u8,
    pub reserved2: u8,
}

/// The request the kernel sends for `EXCEPTION_DEFAULT | MACH_EXCEPTION_CODES`
#[repr(C)]
pub struct ExceptionMessage {
    pub header: msg::mach_msg_header_t,
    pub body: msg::mach_msg_body_t,
    pub thread: msg::mach_msg_port_descriptor_t,
    pub task: msg::mach_msg_port_descriptor_t,
    pub ndr: NDR_record_t,
    pub exception: et::exception_type_t,
    pub code_count: msg::mach_msg_type_number_t,
    pub code: [i64; 2],
    pub padding: [u8; 512],
}

/// The reply MIG expects for an exception request, `mig_errors.h`
#[repr(C)]
pub struct ExceptionRaiseReply {
    pub header: msg::mach_msg_header_t,
    pub ndr: NDR_record_t,
    pub ret_code: kern_return_t,
}

extern "C" {
    /// Atomically swaps the task's registered exception ports matching the
    /// mask with a new one, returning the previous registrations as parallel
    /// arrays. `task.h`
    pub fn task_swap_exception_ports(
        task: mt::task_t,
        exception_mask: et::exception_mask_t,
        new_port: mach_port_t,
        behavior: et::exception_behavior_t,
        new_flavor: ts::thread_state_flavor_t,
        masks: *mut et::exception_mask_t,
        masks_count: *mut u32,
        old_handlers: *mut mach_port_t,
        old_behaviors: *mut et::exception_behavior_t,
        old_flavors: *mut ts::thread_state_flavor_t,
    ) -> kern_return_t;

    /// Re-registers a single exception port. `task.h`
    pub fn task_set_exception_ports(
        task: mt::task_t,
        exception_mask: et::exception_mask_t,
        new_port: mach_port_t,
        behavior: et::exception_behavior_t,
        new_flavor: ts::thread_state_flavor_t,
    ) -> kern_return_t;

    /// The host NDR, `<arch>/ndr_def.h`
    pub static NDR_record: NDR_record_t;
}
