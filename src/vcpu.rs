use core::cell::RefCell;

use axerrno::{ax_err, AxError, AxResult};

use crate::memory::GuestPhysAddr;
use crate::{AxArchVCpu, AxVCpuExitReason};

/// The state of a virtual CPU.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VCpuState {
    /// An invalid state, entered after any failed operation.
    Invalid = 0,
    /// The vcpu is created but not initialized yet.
    Created = 1,
    /// The vcpu is initialized and may be run.
    Ready = 3,
    /// The vcpu is inside [`AxVCpu::run`].
    Running = 4,
}

/// The mutable part of [`AxVCpu`].
struct AxVCpuInnerMut {
    /// The state of the vcpu.
    state: VCpuState,
    /// Bytes still owed to the guest for the last read exit.
    pending_read: Option<usize>,
}

/// A virtual CPU with a backend-independent interface.
///
/// Backend-specific operations are delegated to a struct implementing
/// [`AxArchVCpu`]; this wrapper owns the lifecycle so that a VCPU is never run
/// before setup, and never re-entered while a read result is still owed to
/// the guest.
///
/// Like the rest of the monitor core, this struct is used from one thread.
pub struct AxVCpu<A: AxArchVCpu> {
    id: usize,
    inner_mut: RefCell<AxVCpuInnerMut>,
    arch_vcpu: RefCell<A>,
}

impl<A: AxArchVCpu> AxVCpu<A> {
    /// Wrap a freshly created backend VCPU.
    pub fn new(id: usize, arch_vcpu: A) -> Self {
        Self {
            id,
            inner_mut: RefCell::new(AxVCpuInnerMut {
                state: VCpuState::Created,
                pending_read: None,
            }),
            arch_vcpu: RefCell::new(arch_vcpu),
        }
    }

    /// Setup the vcpu to start at `entry` with `boot_params` handed to the guest.
    pub fn setup(&self, entry: GuestPhysAddr, boot_params: GuestPhysAddr) -> AxResult {
        self.manipulate_arch_vcpu(VCpuState::Created, VCpuState::Ready, |arch_vcpu| {
            arch_vcpu.set_entry(entry)?;
            arch_vcpu.set_boot_params(boot_params)?;
            arch_vcpu.setup()?;
            Ok(())
        })
    }

    /// Get the id of the vcpu.
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Get whether the vcpu is the BSP. The vcpu with id #0 is always the BSP.
    pub const fn is_bsp(&self) -> bool {
        self.id == 0
    }

    /// Get the state of the vcpu.
    pub fn state(&self) -> VCpuState {
        self.inner_mut.borrow().state
    }

    /// Execute a block with the state of the vcpu transitioned from `from` to `to`. If the current state is not `from`, return an error.
    ///
    /// The state will be set to [`VCpuState::Invalid`] if an error occurs (including the case that the current state is not `from`).
    ///
    /// The state will be set to `to` if the block is executed successfully.
    pub fn with_state_transition<F, T>(&self, from: VCpuState, to: VCpuState, f: F) -> AxResult<T>
    where
        F: FnOnce() -> AxResult<T>,
    {
        let mut inner_mut = self.inner_mut.borrow_mut();
        if inner_mut.state != from {
            let actual = inner_mut.state;
            inner_mut.state = VCpuState::Invalid;
            ax_err!(
                BadState,
                format!("VCpu state is not {:?}, but {:?}", from, actual)
            )
        } else {
            let result = f();
            inner_mut.state = if result.is_err() {
                VCpuState::Invalid
            } else {
                to
            };
            result
        }
    }

    /// Execute an operation on the backend vcpu with the state transitioned from `from` to `to`.
    pub fn manipulate_arch_vcpu<F, T>(&self, from: VCpuState, to: VCpuState, f: F) -> AxResult<T>
    where
        F: FnOnce(&mut A) -> AxResult<T>,
    {
        self.with_state_transition(from, to, || f(&mut self.arch_vcpu.borrow_mut()))
    }

    /// Transition the state of the vcpu. If the current state is not `from`, return an error.
    pub fn transition_state(&self, from: VCpuState, to: VCpuState) -> AxResult {
        self.with_state_transition(from, to, || Ok(()))
    }

    /// Run the vcpu until its next exit.
    ///
    /// A transient interruption (`WouldBlock`) leaves the vcpu [`VCpuState::Ready`]
    /// so the call can simply be repeated; any other failure invalidates it.
    pub fn run(&self) -> AxResult<AxVCpuExitReason> {
        if let Some(len) = self.inner_mut.borrow().pending_read {
            return ax_err!(
                BadState,
                format!("vcpu {} still owes {} bytes of read data", self.id, len)
            );
        }
        self.transition_state(VCpuState::Ready, VCpuState::Running)?;

        let result = self.arch_vcpu.borrow_mut().run();
        let mut inner_mut = self.inner_mut.borrow_mut();
        match &result {
            Ok(exit) => {
                inner_mut.state = VCpuState::Ready;
                inner_mut.pending_read = exit.read_len();
            }
            Err(AxError::WouldBlock) => inner_mut.state = VCpuState::Ready,
            Err(_) => inner_mut.state = VCpuState::Invalid,
        }
        result
    }

    /// Complete the last read exit with `data`.
    ///
    /// `data` must be exactly as long as the exit asked for.
    pub fn set_read_data(&self, data: &[u8]) -> AxResult {
        let expected = self.inner_mut.borrow().pending_read;
        match expected {
            Some(len) if len == data.len() => {
                self.manipulate_arch_vcpu(VCpuState::Ready, VCpuState::Ready, |arch_vcpu| {
                    arch_vcpu.set_read_data(data)
                })?;
                self.inner_mut.borrow_mut().pending_read = None;
                Ok(())
            }
            Some(len) => ax_err!(
                InvalidInput,
                format!("read exit wants {} bytes, got {}", len, data.len())
            ),
            None => ax_err!(BadState, "no read exit is pending"),
        }
    }
}
