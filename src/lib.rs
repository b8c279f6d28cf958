// Copyright 2025 The Axvisor Team
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AxKvm - a minimal KVM-backed virtual machine monitor.
//!
//! The crate boots a Linux bzImage on a single virtual CPU and exposes
//! devices to it through a virtio-over-PCI transport. Hypervisor-specific
//! operations are delegated to implementations of the [`AxVmHal`] and
//! [`AxArchVCpu`] traits, so the run loop, buses and devices can be driven
//! by the KVM backend or by a test double.
//!
//! # Layout
//!
//! - [`memory`]: guest RAM and the bounds-checked address translator
//! - [`bus`]: port-I/O and MMIO dispatch to registered devices
//! - [`pci`] and [`virtio`]: PCI configuration space, the virtio-pci
//!   transport and the virtqueue engine
//! - [`serial`]: the COM1 console
//! - [`loader`]: Linux boot protocol
//! - [`vm`]: VM assembly and the VCPU run loop
//! - [`kvm`]: the Linux KVM backend

#[macro_use]
extern crate log;

// Core modules
mod arch_vcpu; // Backend VCpu trait definition
mod exit; // VM exit reason enumeration
mod hal; // Hypervisor abstraction layer interfaces
mod vcpu; // VCpu lifecycle and state management

pub mod bus;
pub mod config;
pub mod kvm;
pub mod loader;
pub mod memory;
pub mod pci;
pub mod serial;
pub mod virtio;
pub mod vm;

#[cfg(test)]
mod test; // Test doubles and run loop tests

// Public API exports
pub use arch_vcpu::AxArchVCpu;
pub use config::VmConfig;
pub use exit::AxVCpuExitReason;
pub use hal::{AxVmHal, InterruptSink};
pub use vcpu::*;
pub use vm::{AxVm, ExitStatus};
