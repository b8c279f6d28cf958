//! Test doubles shared by the unit tests, and the VCPU and run loop tests.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Write};
use std::rc::Rc;
use std::sync::{Arc, Mutex};

use axerrno::{AxError, AxResult};

use crate::memory::{GuestMemory, GuestPhysAddr};
use crate::virtio::{DescriptorChain, VirtioDevice};
use crate::{AxArchVCpu, AxVCpuExitReason, AxVmHal, InterruptSink};

/// Everything a [`MockArchVCpu`] does, and what it will return next.
#[derive(Debug, Default)]
pub struct MockScript {
    /// Results handed out by successive `run` calls.
    pub exits: VecDeque<AxResult<AxVCpuExitReason>>,
    /// Data passed to every `set_read_data` call, in order.
    pub read_data: Vec<Vec<u8>>,
    /// Names of the trait methods called, in order.
    pub calls: Vec<String>,
    pub entry: Option<GuestPhysAddr>,
    pub boot_params: Option<GuestPhysAddr>,
}

pub type SharedScript = Rc<RefCell<MockScript>>;

/// A backend VCPU that replays scripted exits.
///
/// Once the script runs out every `run` reports [`AxVCpuExitReason::SystemDown`].
#[derive(Debug)]
pub struct MockArchVCpu {
    script: SharedScript,
}

impl MockArchVCpu {
    pub fn new(script: SharedScript) -> Self {
        Self { script }
    }

    fn log(&self, call: &str) {
        self.script.borrow_mut().calls.push(call.to_string());
    }
}

impl AxArchVCpu for MockArchVCpu {
    fn set_entry(&mut self, entry: GuestPhysAddr) -> AxResult {
        self.log("set_entry");
        self.script.borrow_mut().entry = Some(entry);
        Ok(())
    }

    fn set_boot_params(&mut self, boot_params: GuestPhysAddr) -> AxResult {
        self.log("set_boot_params");
        self.script.borrow_mut().boot_params = Some(boot_params);
        Ok(())
    }

    fn setup(&mut self) -> AxResult {
        self.log("setup");
        if self.script.borrow().entry.is_none() {
            return Err(AxError::InvalidInput);
        }
        Ok(())
    }

    fn run(&mut self) -> AxResult<AxVCpuExitReason> {
        self.log("run");
        self.script
            .borrow_mut()
            .exits
            .pop_front()
            .unwrap_or(Ok(AxVCpuExitReason::SystemDown))
    }

    fn set_read_data(&mut self, data: &[u8]) -> AxResult {
        self.log("set_read_data");
        self.script.borrow_mut().read_data.push(data.to_vec());
        Ok(())
    }
}

/// A hypervisor that hands out [`MockArchVCpu`]s sharing one script.
pub struct MockHal {
    pub script: SharedScript,
    pub sink: Arc<RecordingSink>,
    pub memory_slots: Vec<u32>,
}

impl MockHal {
    pub fn new() -> Self {
        Self {
            script: SharedScript::default(),
            sink: Arc::new(RecordingSink::default()),
            memory_slots: Vec::new(),
        }
    }
}

impl AxVmHal for MockHal {
    type VCpu = MockArchVCpu;

    unsafe fn install_memory(&mut self, slot: u32, _mem: &GuestMemory) -> AxResult {
        self.memory_slots.push(slot);
        Ok(())
    }

    fn create_vcpu(&mut self, _id: usize) -> AxResult<MockArchVCpu> {
        Ok(MockArchVCpu::new(self.script.clone()))
    }

    fn interrupt_sink(&self) -> Arc<dyn InterruptSink> {
        self.sink.clone()
    }
}

/// Records every interrupt line change.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<(u32, bool)>>,
}

impl RecordingSink {
    pub fn events(&self) -> Vec<(u32, bool)> {
        self.events.lock().unwrap().clone()
    }
}

impl InterruptSink for RecordingSink {
    fn set_irq_line(&self, irq: u32, level: bool) -> AxResult {
        self.events.lock().unwrap().push((irq, level));
        Ok(())
    }
}

/// A console sink whose contents the test can inspect.
#[derive(Clone, Debug, Default)]
pub struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

impl SharedBuffer {
    pub fn contents(&self) -> Vec<u8> {
        self.0.borrow().clone()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[derive(Debug, Default)]
struct RecordingState {
    config: Vec<u8>,
    requests: Vec<(u16, u16)>,
    resets: usize,
}

/// A virtio device that fills every writable buffer with its queue index and
/// records the requests it sees. Clones share state.
#[derive(Clone, Debug)]
pub struct RecordingDevice {
    state: Rc<RefCell<RecordingState>>,
}

impl RecordingDevice {
    pub const DEVICE_TYPE: u16 = 4;
    pub const QUEUE_SIZE: u16 = 8;
    pub const CONFIG_LEN: usize = 8;

    pub fn new() -> Self {
        Self {
            state: Rc::new(RefCell::new(RecordingState {
                config: (1..=Self::CONFIG_LEN as u8).collect(),
                ..Default::default()
            })),
        }
    }

    /// `(queue, head)` of every request processed so far.
    pub fn requests(&self) -> Vec<(u16, u16)> {
        self.state.borrow().requests.clone()
    }

    pub fn resets(&self) -> usize {
        self.state.borrow().resets
    }
}

impl VirtioDevice for RecordingDevice {
    fn device_type(&self) -> u16 {
        Self::DEVICE_TYPE
    }

    fn features(&self) -> u64 {
        (1 << 33) | 1
    }

    fn num_queues(&self) -> u16 {
        2
    }

    fn queue_max_size(&self, _queue: u16) -> u16 {
        Self::QUEUE_SIZE
    }

    fn config_len(&self) -> usize {
        Self::CONFIG_LEN
    }

    fn read_config(&self, offset: u64, data: &mut [u8]) {
        let state = self.state.borrow();
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = state.config.get(offset as usize + i).copied().unwrap_or(0);
        }
    }

    fn write_config(&mut self, offset: u64, data: &[u8]) {
        let mut state = self.state.borrow_mut();
        for (i, byte) in data.iter().enumerate() {
            if let Some(slot) = state.config.get_mut(offset as usize + i) {
                *slot = *byte;
            }
        }
    }

    fn process_chain(&mut self, queue: u16, chain: &DescriptorChain, mem: &GuestMemory) -> AxResult<u32> {
        self.state.borrow_mut().requests.push((queue, chain.head()));
        let mut written = 0;
        for desc in chain.writable() {
            mem.fill(desc.addr, queue as u8, desc.len as usize)?;
            written += desc.len;
        }
        Ok(written)
    }

    fn reset(&mut self) {
        self.state.borrow_mut().resets += 1;
    }
}

/// Write descriptor `index` of the table at `desc_base`.
pub fn write_desc(
    mem: &GuestMemory,
    desc_base: u64,
    index: u16,
    addr: u64,
    len: u32,
    flags: u16,
    next: u16,
) {
    let base = GuestPhysAddr::from((desc_base + 16 * index as u64) as usize);
    mem.write_u64(base, addr).unwrap();
    mem.write_u32(base + 8, len).unwrap();
    mem.write_u16(base + 12, flags).unwrap();
    mem.write_u16(base + 14, next).unwrap();
}

/// Append `heads` to the available ring at `avail_base` and publish them.
pub fn publish_avail(mem: &GuestMemory, avail_base: u64, size: u16, heads: &[u16]) {
    let idx_addr = GuestPhysAddr::from(avail_base as usize + 2);
    let mut idx = mem.read_u16(idx_addr).unwrap();
    for &head in heads {
        let slot = (idx % size) as usize;
        mem.write_u16(GuestPhysAddr::from(avail_base as usize + 4 + 2 * slot), head)
            .unwrap();
        idx = idx.wrapping_add(1);
    }
    mem.write_u16(idx_addr, idx).unwrap();
}

/// A minimal bzImage: one setup sector, boot protocol 2.15 and `extra`
/// bytes beyond the first page of protected-mode kernel.
pub fn fake_bzimage(extra: usize) -> Vec<u8> {
    let mut image = vec![0u8; 0x1000 + extra];
    image[0x1f1] = 1;
    image[0x201] = 0x66;
    image[0x202..0x206].copy_from_slice(b"HdrS");
    image[0x206..0x208].copy_from_slice(&0x020fu16.to_le_bytes());
    image[0x22c..0x230].copy_from_slice(&0x37ff_ffffu32.to_le_bytes());
    image[0x238..0x23c].copy_from_slice(&255u32.to_le_bytes());
    for (i, b) in image[0x400..].iter_mut().enumerate() {
        *b = i as u8;
    }
    image
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::AccessWidth;
    use crate::serial::SERIAL_IRQ;
    use crate::virtio::status;
    use crate::vm::{AxVm, ExitStatus, VIRTIO_MMIO_BASE};
    use crate::{AxVCpu, VCpuState, VmConfig};

    const RAM_SIZE: usize = 4 << 20;

    fn create_mock_vcpu() -> (AxVCpu<MockArchVCpu>, SharedScript) {
        let script = SharedScript::default();
        let vcpu = AxVCpu::new(0, MockArchVCpu::new(script.clone()));
        (vcpu, script)
    }

    fn ready_vcpu() -> (AxVCpu<MockArchVCpu>, SharedScript) {
        let (vcpu, script) = create_mock_vcpu();
        vcpu.setup(GuestPhysAddr::from(0x100000), GuestPhysAddr::from(0x10000))
            .unwrap();
        (vcpu, script)
    }

    fn script_exits(script: &SharedScript, exits: Vec<AxResult<AxVCpuExitReason>>) {
        script.borrow_mut().exits.extend(exits);
    }

    #[test]
    fn test_vcpu_creation() {
        let (vcpu, script) = create_mock_vcpu();

        assert_eq!(vcpu.id(), 0);
        assert_eq!(vcpu.state(), VCpuState::Created);
        assert!(vcpu.is_bsp());
        assert!(script.borrow().calls.is_empty());
    }

    #[test]
    fn test_vcpu_setup_lifecycle() {
        let (vcpu, script) = ready_vcpu();

        assert_eq!(vcpu.state(), VCpuState::Ready);
        let script = script.borrow();
        assert_eq!(script.calls, ["set_entry", "set_boot_params", "setup"]);
        assert_eq!(script.entry, Some(GuestPhysAddr::from(0x100000)));
        assert_eq!(script.boot_params, Some(GuestPhysAddr::from(0x10000)));
    }

    #[test]
    fn test_vcpu_state_transitions() {
        let (vcpu, _) = create_mock_vcpu();

        // Created -> Ready
        assert_eq!(vcpu.state(), VCpuState::Created);
        let result = vcpu.transition_state(VCpuState::Created, VCpuState::Ready);
        assert!(result.is_ok());
        assert_eq!(vcpu.state(), VCpuState::Ready);

        // Invalid transition should fail
        let result = vcpu.transition_state(VCpuState::Running, VCpuState::Ready);
        assert_eq!(result, Err(AxError::BadState));
        assert_eq!(vcpu.state(), VCpuState::Invalid);
    }

    #[test]
    fn test_vcpu_setup_wrong_state() {
        let (vcpu, _) = ready_vcpu();
        assert_eq!(
            vcpu.setup(GuestPhysAddr::from(0), GuestPhysAddr::from(0)),
            Err(AxError::BadState)
        );
        assert_eq!(vcpu.state(), VCpuState::Invalid);
    }

    #[test]
    fn test_vcpu_run_before_setup() {
        let (vcpu, script) = create_mock_vcpu();
        assert_eq!(vcpu.run(), Err(AxError::BadState));
        assert!(!script.borrow().calls.contains(&"run".to_string()));
    }

    #[test]
    fn test_vcpu_read_exit_needs_data() {
        let (vcpu, script) = ready_vcpu();
        script_exits(
            &script,
            vec![Ok(AxVCpuExitReason::IoRead {
                port: 0x60,
                width: AccessWidth::Word,
                count: 2,
            })],
        );

        assert!(matches!(vcpu.run(), Ok(AxVCpuExitReason::IoRead { .. })));
        // the guest is still waiting for its data
        assert_eq!(vcpu.run(), Err(AxError::BadState));
        assert_eq!(vcpu.set_read_data(&[1, 2]), Err(AxError::InvalidInput));

        vcpu.set_read_data(&[1, 2, 3, 4]).unwrap();
        assert_eq!(script.borrow().read_data, vec![vec![1, 2, 3, 4]]);
        assert_eq!(vcpu.set_read_data(&[0; 4]), Err(AxError::BadState));
        assert_eq!(vcpu.run(), Ok(AxVCpuExitReason::SystemDown));
    }

    #[test]
    fn test_vcpu_run_failures() {
        let (vcpu, script) = ready_vcpu();
        script_exits(&script, vec![Err(AxError::WouldBlock), Err(AxError::Io)]);

        assert_eq!(vcpu.run(), Err(AxError::WouldBlock));
        assert_eq!(vcpu.state(), VCpuState::Ready);
        assert_eq!(vcpu.run(), Err(AxError::Io));
        assert_eq!(vcpu.state(), VCpuState::Invalid);
    }

    #[test]
    fn test_vcpu_bsp_identification() {
        let script = SharedScript::default();
        let vcpu0 = AxVCpu::new(0, MockArchVCpu::new(script.clone()));
        let vcpu1 = AxVCpu::new(1, MockArchVCpu::new(script));

        assert!(vcpu0.is_bsp());
        assert!(!vcpu1.is_bsp());
    }

    #[test]
    fn test_vcpu_state_values() {
        assert_eq!(VCpuState::Invalid as u8, 0);
        assert_eq!(VCpuState::Created as u8, 1);
        assert_eq!(VCpuState::Ready as u8, 3);
        assert_eq!(VCpuState::Running as u8, 4);
    }

    #[test]
    fn test_exit_reason_read_len() {
        let io = AxVCpuExitReason::IoRead {
            port: 0x3f8,
            width: AccessWidth::Byte,
            count: 5,
        };
        let mmio = AxVCpuExitReason::MmioRead {
            addr: GuestPhysAddr::from(0x1000),
            width: AccessWidth::Dword,
        };
        assert_eq!(io.read_len(), Some(5));
        assert_eq!(mmio.read_len(), Some(4));
        assert_eq!(AxVCpuExitReason::Halt.read_len(), None);

        let debug_str = format!("{:?}", mmio);
        assert!(debug_str.contains("MmioRead"));
        assert!(debug_str.contains("0x1000"));
    }

    struct TestVm {
        vm: AxVm<MockHal>,
        script: SharedScript,
        sink: Arc<RecordingSink>,
        console: SharedBuffer,
    }

    fn test_vm() -> TestVm {
        let hal = MockHal::new();
        let script = hal.script.clone();
        let sink = hal.sink.clone();
        let console = SharedBuffer::default();

        let mut config = VmConfig::new("bzImage");
        config.ram_size = RAM_SIZE;
        let mut vm = AxVm::with_console(hal, &config, Box::new(console.clone())).unwrap();
        vm.load_images(&fake_bzimage(0x1000), None, "console=ttyS0")
            .unwrap();
        TestVm {
            vm,
            script,
            sink,
            console,
        }
    }

    fn io_write(port: u16, width: AccessWidth, data: &[u8]) -> AxResult<AxVCpuExitReason> {
        Ok(AxVCpuExitReason::IoWrite {
            port,
            width,
            data: data.to_vec(),
        })
    }

    fn io_read(port: u16, width: AccessWidth, count: usize) -> AxResult<AxVCpuExitReason> {
        Ok(AxVCpuExitReason::IoRead { port, width, count })
    }

    #[test]
    fn vm_setup_installs_memory_and_seeds_vcpu() {
        let t = test_vm();
        assert_eq!(t.vm.hal().memory_slots, vec![0]);
        assert_eq!(t.vm.memory().size(), RAM_SIZE);
        let script = t.script.borrow();
        assert_eq!(script.entry, Some(GuestPhysAddr::from(0x100000)));
        assert_eq!(script.boot_params, Some(GuestPhysAddr::from(0x10000)));
    }

    #[test]
    fn run_until_shutdown() {
        let mut t = test_vm();
        script_exits(
            &t.script,
            vec![
                io_write(0x3f8, AccessWidth::Byte, b"hi\n"),
                Ok(AxVCpuExitReason::Nothing),
                Ok(AxVCpuExitReason::SystemDown),
            ],
        );
        assert_eq!(t.vm.run(), Ok(ExitStatus::Shutdown));
        assert_eq!(t.console.contents(), b"hi\n");
    }

    #[test]
    fn unknown_exit_is_fatal() {
        let mut t = test_vm();
        script_exits(
            &t.script,
            vec![
                Ok(AxVCpuExitReason::Unknown { exit_reason: 99 }),
                Ok(AxVCpuExitReason::SystemDown),
            ],
        );
        assert_eq!(
            t.vm.run(),
            Ok(ExitStatus::Fatal(AxVCpuExitReason::Unknown { exit_reason: 99 }))
        );
        // the loop stopped at the fatal exit
        assert_eq!(t.script.borrow().exits.len(), 1);
    }

    #[test]
    fn transient_interruption_is_retried() {
        let mut t = test_vm();
        script_exits(
            &t.script,
            vec![Err(AxError::WouldBlock), Err(AxError::WouldBlock)],
        );
        assert_eq!(t.vm.run(), Ok(ExitStatus::Shutdown));
        let runs = t.script.borrow().calls.iter().filter(|c| *c == "run").count();
        assert_eq!(runs, 3);
    }

    #[test]
    fn hypervisor_failure_ends_the_loop() {
        let mut t = test_vm();
        script_exits(&t.script, vec![Err(AxError::Io)]);
        assert_eq!(t.vm.run(), Err(AxError::Io));
    }

    #[test]
    fn port_io_reaches_pci_root_and_serial() {
        let mut t = test_vm();
        script_exits(
            &t.script,
            vec![
                io_write(0xcf8, AccessWidth::Dword, &0x8000_0000u32.to_le_bytes()),
                io_read(0xcfc, AccessWidth::Dword, 1),
                io_read(0x3fd, AccessWidth::Byte, 1),
                // nothing decodes port 0x80
                io_read(0x80, AccessWidth::Word, 2),
            ],
        );
        assert_eq!(t.vm.run(), Ok(ExitStatus::Shutdown));
        assert_eq!(
            t.script.borrow().read_data,
            vec![
                0x1237_8086u32.to_le_bytes().to_vec(),
                vec![0x60],
                vec![0xff; 4],
            ]
        );
    }

    #[test]
    fn console_input_raises_serial_irq() {
        let mut t = test_vm();
        t.vm.serial_input().push(b"k");
        script_exits(
            &t.script,
            vec![
                io_write(0x3f9, AccessWidth::Byte, &[0x01]),
                io_read(0x3f8, AccessWidth::Byte, 1),
                Ok(AxVCpuExitReason::IrqWindowOpen),
            ],
        );
        assert_eq!(t.vm.run(), Ok(ExitStatus::Shutdown));
        assert_eq!(t.sink.events(), vec![(SERIAL_IRQ, true), (SERIAL_IRQ, false)]);
        assert_eq!(t.script.borrow().read_data, vec![vec![b'k']]);
    }

    fn bar0_write(vm: &AxVm<MockHal>, offset: u64, data: &[u8]) {
        vm.mmio_bus()
            .write(VIRTIO_MMIO_BASE as u64 + 0x1000 + offset, data)
            .unwrap();
    }

    #[test]
    fn mmio_reaches_virtio_transport() {
        let mut t = test_vm();
        let device = RecordingDevice::new();
        assert_eq!(t.vm.attach_virtio_device(Box::new(device), 10).unwrap(), 1);
        let bar0 = GuestPhysAddr::from(VIRTIO_MMIO_BASE as usize + 0x1000);

        script_exits(
            &t.script,
            vec![
                // PCI function in slot 1
                io_write(0xcf8, AccessWidth::Dword, &0x8000_0800u32.to_le_bytes()),
                io_read(0xcfc, AccessWidth::Dword, 1),
                // num_queues
                Ok(AxVCpuExitReason::MmioRead {
                    addr: bar0 + 0x12,
                    width: AccessWidth::Word,
                }),
                // device_status = ACKNOWLEDGE
                Ok(AxVCpuExitReason::MmioWrite {
                    addr: bar0 + 0x14,
                    width: AccessWidth::Byte,
                    data: status::ACKNOWLEDGE as u64,
                }),
                Ok(AxVCpuExitReason::MmioRead {
                    addr: bar0 + 0x14,
                    width: AccessWidth::Byte,
                }),
            ],
        );
        assert_eq!(t.vm.run(), Ok(ExitStatus::Shutdown));
        assert_eq!(
            t.script.borrow().read_data,
            vec![
                0x1044_1af4u32.to_le_bytes().to_vec(),
                vec![2, 0],
                vec![status::ACKNOWLEDGE],
            ]
        );
    }

    #[test]
    fn out_of_bounds_descriptor_stops_the_vm() {
        let mut t = test_vm();
        t.vm
            .attach_virtio_device(Box::new(RecordingDevice::new()), 10)
            .unwrap();

        let driver = status::ACKNOWLEDGE | status::DRIVER;
        bar0_write(&t.vm, 0x14, &[driver]);
        bar0_write(&t.vm, 0x08, &1u32.to_le_bytes());
        bar0_write(&t.vm, 0x0c, &1u32.to_le_bytes());
        bar0_write(&t.vm, 0x14, &[driver | status::FEATURES_OK]);
        bar0_write(&t.vm, 0x16, &0u16.to_le_bytes());
        bar0_write(&t.vm, 0x18, &4u16.to_le_bytes());
        bar0_write(&t.vm, 0x20, &0x1000u64.to_le_bytes());
        bar0_write(&t.vm, 0x28, &0x2000u64.to_le_bytes());
        bar0_write(&t.vm, 0x30, &0x3000u64.to_le_bytes());
        bar0_write(&t.vm, 0x1c, &1u16.to_le_bytes());
        bar0_write(
            &t.vm,
            0x14,
            &[driver | status::FEATURES_OK | status::DRIVER_OK],
        );

        let mem = t.vm.memory().clone();
        write_desc(&mem, 0x1000, 0, (RAM_SIZE - 8) as u64, 0x10, 0, 0);
        publish_avail(&mem, 0x2000, 4, &[0]);

        script_exits(
            &t.script,
            vec![Ok(AxVCpuExitReason::MmioWrite {
                addr: GuestPhysAddr::from(VIRTIO_MMIO_BASE as usize + 0x1000 + 0x38),
                width: AccessWidth::Word,
                data: 0,
            })],
        );
        assert_eq!(t.vm.run(), Err(AxError::BadAddress));
    }
}
