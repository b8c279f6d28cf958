//! A 16550-style UART on COM1.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use axerrno::{ax_err, AxResult};

use crate::bus::Port;
use crate::hal::InterruptSink;

/// First port of COM1.
pub const SERIAL_PORT_BASE: Port = 0x3f8;
/// Number of ports COM1 decodes.
pub const SERIAL_PORT_LEN: Port = 8;
/// ISA interrupt line of COM1.
pub const SERIAL_IRQ: u32 = 4;

const FIFO_CAPACITY: usize = 64;

const UART_RX: u16 = 0; // RBR / THR / DLL
const UART_IER: u16 = 1; // IER / DLM
const UART_IIR: u16 = 2; // IIR / FCR
const UART_LCR: u16 = 3;
const UART_MCR: u16 = 4;
const UART_LSR: u16 = 5;
const UART_MSR: u16 = 6;
const UART_SCR: u16 = 7;

const UART_IER_RDI: u8 = 0x01;
const UART_IER_THRI: u8 = 0x02;

const UART_IIR_NO_INT: u8 = 0x01;
const UART_IIR_THRI: u8 = 0x02;
const UART_IIR_RDI: u8 = 0x04;
const UART_IIR_FIFO_ENABLED: u8 = 0xc0;

const UART_FCR_ENABLE_FIFO: u8 = 0x01;

const UART_LCR_DLAB: u8 = 0x80;

const UART_MCR_DTR: u8 = 0x01;
const UART_MCR_RTS: u8 = 0x02;
const UART_MCR_OUT1: u8 = 0x04;
const UART_MCR_OUT2: u8 = 0x08;
const UART_MCR_LOOP: u8 = 0x10;

const UART_LSR_DR: u8 = 0x01;
const UART_LSR_THRE: u8 = 0x20;
const UART_LSR_TEMT: u8 = 0x40;

const UART_MSR_CTS: u8 = 0x10;
const UART_MSR_DSR: u8 = 0x20;
const UART_MSR_RI: u8 = 0x40;
const UART_MSR_DCD: u8 = 0x80;

/// Producer side of the UART receive FIFO, shareable with other threads.
#[derive(Clone, Debug, Default)]
pub struct SerialInput {
    fifo: Arc<Mutex<VecDeque<u8>>>,
    /// Set when bytes arrive, cleared once the guest has been interrupted.
    fresh: Arc<AtomicBool>,
}

impl SerialInput {
    fn lock(&self) -> MutexGuard<'_, VecDeque<u8>> {
        self.fifo.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue as much of `bytes` as fits and return how many were taken.
    pub fn push(&self, bytes: &[u8]) -> usize {
        let mut fifo = self.lock();
        let n = bytes.len().min(FIFO_CAPACITY - fifo.len());
        fifo.extend(&bytes[..n]);
        if n > 0 {
            self.fresh.store(true, Ordering::Release);
        }
        n
    }

    fn has_fresh(&self) -> bool {
        self.fresh.load(Ordering::Acquire)
    }

    fn take_fresh(&self) -> bool {
        self.fresh.swap(false, Ordering::AcqRel)
    }

    fn pop(&self) -> Option<u8> {
        self.lock().pop_front()
    }

    /// Whether any received byte is waiting for the guest.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forward everything read from `reader` into the FIFO on a new thread.
    ///
    /// `waker` is called after each chunk so the VCPU thread can get out of
    /// the guest and deliver the receive interrupt.
    pub fn spawn_reader<R, W>(self, mut reader: R, waker: W) -> std::io::Result<JoinHandle<()>>
    where
        R: Read + Send + 'static,
        W: Fn() + Send + 'static,
    {
        thread::Builder::new()
            .name("serial-input".into())
            .spawn(move || {
                let mut buf = [0u8; FIFO_CAPACITY];
                loop {
                    let n = match reader.read(&mut buf) {
                        Ok(0) => break,
                        Ok(n) => n,
                        Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                        Err(e) => {
                            warn!("serial input: {}", e);
                            break;
                        }
                    };
                    let mut pending = &buf[..n];
                    while !pending.is_empty() {
                        let taken = self.push(pending);
                        pending = &pending[taken..];
                        waker();
                        if !pending.is_empty() {
                            thread::sleep(Duration::from_millis(1));
                        }
                    }
                }
                debug!("serial input closed");
            })
    }
}

/// COM1 as seen by the guest.
pub struct Serial {
    ier: u8,
    lcr: u8,
    mcr: u8,
    fcr: u8,
    scr: u8,
    dll: u8,
    dlm: u8,
    thr_interrupt: bool,
    input: SerialInput,
    output: Box<dyn Write>,
    interrupt: Arc<dyn InterruptSink>,
}

impl Serial {
    /// A UART whose transmitted bytes go to `output`.
    pub fn new(interrupt: Arc<dyn InterruptSink>, output: Box<dyn Write>) -> Self {
        Self {
            ier: 0,
            lcr: 0x03,
            mcr: UART_MCR_OUT2,
            fcr: 0,
            scr: 0,
            dll: 0x0c,
            dlm: 0,
            thr_interrupt: false,
            input: SerialInput::default(),
            output,
            interrupt,
        }
    }

    /// The receive FIFO, for feeding input from another thread.
    pub fn input(&self) -> SerialInput {
        self.input.clone()
    }

    /// Handle a port access at `offset` from [`SERIAL_PORT_BASE`].
    ///
    /// `data` holds `data.len() / size` repeated accesses to the same register.
    pub fn access(&mut self, offset: Port, is_write: bool, data: &mut [u8], size: usize) -> AxResult {
        if offset >= SERIAL_PORT_LEN {
            return ax_err!(InvalidInput, format!("serial offset {} out of range", offset));
        }
        if size == 0 || data.len() % size != 0 {
            return ax_err!(
                InvalidInput,
                format!("serial access of {} bytes by {}", data.len(), size)
            );
        }

        let mut raise = false;
        for chunk in data.chunks_mut(size) {
            if is_write {
                raise |= self.write_reg(offset, chunk[0])?;
            } else {
                chunk.fill(0);
                chunk[0] = self.read_reg(offset);
            }
        }
        if raise {
            self.interrupt.pulse_irq_line(SERIAL_IRQ)?;
        }
        if is_write && offset == UART_RX && !self.dlab() {
            self.output.flush().map_err(|e| {
                warn!("serial output: {}", e);
                axerrno::ax_err_type!(Io)
            })?;
        }
        Ok(())
    }

    /// Interrupt-window entry point: signal newly received input to the guest.
    pub fn console(&mut self) -> AxResult {
        if self.rx_interrupt() && self.input.take_fresh() {
            trace!("serial: rx interrupt");
            self.interrupt.pulse_irq_line(SERIAL_IRQ)?;
        }
        Ok(())
    }

    /// Whether [`console`](Self::console) has an interrupt to deliver.
    pub fn wants_interrupt_window(&self) -> bool {
        self.ier & UART_IER_RDI != 0 && self.input.has_fresh()
    }

    fn dlab(&self) -> bool {
        self.lcr & UART_LCR_DLAB != 0
    }

    fn rx_interrupt(&self) -> bool {
        self.ier & UART_IER_RDI != 0 && !self.input.is_empty()
    }

    fn read_reg(&mut self, offset: u16) -> u8 {
        let val = match offset {
            UART_RX if self.dlab() => self.dll,
            UART_RX => self.input.pop().unwrap_or(0),
            UART_IER if self.dlab() => self.dlm,
            UART_IER => self.ier,
            UART_IIR => {
                let iir = if self.rx_interrupt() {
                    UART_IIR_RDI
                } else if self.thr_interrupt && self.ier & UART_IER_THRI != 0 {
                    self.thr_interrupt = false;
                    UART_IIR_THRI
                } else {
                    UART_IIR_NO_INT
                };
                if self.fcr & UART_FCR_ENABLE_FIFO != 0 {
                    iir | UART_IIR_FIFO_ENABLED
                } else {
                    iir
                }
            }
            UART_LCR => self.lcr,
            UART_MCR => self.mcr,
            UART_LSR => {
                let dr = if self.input.is_empty() { 0 } else { UART_LSR_DR };
                dr | UART_LSR_THRE | UART_LSR_TEMT
            }
            UART_MSR if self.mcr & UART_MCR_LOOP != 0 => {
                let mut msr = 0;
                if self.mcr & UART_MCR_RTS != 0 {
                    msr |= UART_MSR_CTS;
                }
                if self.mcr & UART_MCR_DTR != 0 {
                    msr |= UART_MSR_DSR;
                }
                if self.mcr & UART_MCR_OUT1 != 0 {
                    msr |= UART_MSR_RI;
                }
                if self.mcr & UART_MCR_OUT2 != 0 {
                    msr |= UART_MSR_DCD;
                }
                msr
            }
            UART_MSR => UART_MSR_DCD | UART_MSR_DSR | UART_MSR_CTS,
            _ => self.scr,
        };
        trace!("serial: read reg {} -> {:#04x}", offset, val);
        val
    }

    /// Returns whether the write makes an interrupt due.
    fn write_reg(&mut self, offset: u16, val: u8) -> AxResult<bool> {
        trace!("serial: write reg {} <- {:#04x}", offset, val);
        match offset {
            UART_RX if self.dlab() => self.dll = val,
            UART_RX => {
                if self.mcr & UART_MCR_LOOP != 0 {
                    self.input.push(&[val]);
                } else {
                    self.output.write_all(&[val]).map_err(|e| {
                        warn!("serial output: {}", e);
                        axerrno::ax_err_type!(Io)
                    })?;
                }
                if self.ier & UART_IER_THRI != 0 {
                    self.thr_interrupt = true;
                    return Ok(true);
                }
            }
            UART_IER if self.dlab() => self.dlm = val,
            UART_IER => {
                let enabled = val & !self.ier;
                self.ier = val & 0x0f;
                if enabled & UART_IER_THRI != 0 {
                    self.thr_interrupt = true;
                    return Ok(true);
                }
                if enabled & UART_IER_RDI != 0 && self.rx_interrupt() {
                    self.input.take_fresh();
                    return Ok(true);
                }
            }
            UART_IIR => self.fcr = val,
            UART_LCR => self.lcr = val,
            UART_MCR => self.mcr = val & 0x1f,
            UART_LSR | UART_MSR => {}
            _ => self.scr = val,
        }
        Ok(false)
    }
}

impl core::fmt::Debug for Serial {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Serial")
            .field("ier", &self.ier)
            .field("lcr", &self.lcr)
            .field("mcr", &self.mcr)
            .field("input", &self.input)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::{RecordingSink, SharedBuffer};
    use axerrno::AxError;
    use std::sync::mpsc;

    fn serial() -> (Serial, SharedBuffer, Arc<RecordingSink>) {
        let out = SharedBuffer::default();
        let sink = Arc::new(RecordingSink::default());
        (Serial::new(sink.clone(), Box::new(out.clone())), out, sink)
    }

    fn read(serial: &mut Serial, offset: u16) -> u8 {
        let mut data = [0u8];
        serial.access(offset, false, &mut data, 1).unwrap();
        data[0]
    }

    fn write(serial: &mut Serial, offset: u16, val: u8) {
        serial.access(offset, true, &mut [val], 1).unwrap();
    }

    #[test]
    fn string_write_reaches_console() {
        let (mut serial, out, sink) = serial();
        let mut data = *b"hello";
        serial.access(UART_RX, true, &mut data, 1).unwrap();
        assert_eq!(out.contents(), b"hello");
        assert!(sink.events().is_empty());
    }

    #[test]
    fn receive_path() {
        let (mut serial, _out, sink) = serial();
        assert_eq!(read(&mut serial, UART_LSR), UART_LSR_THRE | UART_LSR_TEMT);
        assert!(!serial.wants_interrupt_window());

        serial.input().push(b"ab");
        assert_eq!(read(&mut serial, UART_LSR) & UART_LSR_DR, UART_LSR_DR);
        // RX interrupts still disabled
        assert!(!serial.wants_interrupt_window());
        serial.console().unwrap();
        assert!(sink.events().is_empty());

        write(&mut serial, UART_IER, UART_IER_RDI);
        assert_eq!(sink.events(), vec![(SERIAL_IRQ, true), (SERIAL_IRQ, false)]);
        assert!(!serial.wants_interrupt_window());
        assert_eq!(read(&mut serial, UART_IIR), UART_IIR_RDI);

        // only input that arrived since the last interrupt is signalled again
        serial.console().unwrap();
        assert_eq!(sink.events().len(), 2);
        serial.input().push(b"c");
        assert!(serial.wants_interrupt_window());
        serial.console().unwrap();
        assert_eq!(sink.events().len(), 4);
        assert!(!serial.wants_interrupt_window());

        assert_eq!(read(&mut serial, UART_RX), b'a');
        assert_eq!(read(&mut serial, UART_RX), b'b');
        assert_eq!(read(&mut serial, UART_RX), b'c');
        assert_eq!(read(&mut serial, UART_LSR) & UART_LSR_DR, 0);
        assert_eq!(read(&mut serial, UART_IIR), UART_IIR_NO_INT);
        assert!(!serial.wants_interrupt_window());
    }

    #[test]
    fn fifo_is_bounded() {
        let input = SerialInput::default();
        assert_eq!(input.push(&[0u8; 100]), FIFO_CAPACITY);
        assert_eq!(input.push(b"x"), 0);
    }

    #[test]
    fn thr_interrupt_reported_once() {
        let (mut serial, _out, sink) = serial();
        write(&mut serial, UART_IER, UART_IER_THRI);
        assert_eq!(sink.events().len(), 2);
        assert_eq!(read(&mut serial, UART_IIR), UART_IIR_THRI);
        assert_eq!(read(&mut serial, UART_IIR), UART_IIR_NO_INT);

        write(&mut serial, UART_RX, b'x');
        assert_eq!(sink.events().len(), 4);
        write(&mut serial, UART_IIR, UART_FCR_ENABLE_FIFO);
        assert_eq!(read(&mut serial, UART_IIR), UART_IIR_THRI | UART_IIR_FIFO_ENABLED);
    }

    #[test]
    fn divisor_latch_and_loopback() {
        let (mut serial, out, _sink) = serial();
        write(&mut serial, UART_LCR, UART_LCR_DLAB | 0x03);
        write(&mut serial, UART_RX, 0x01);
        write(&mut serial, UART_IER, 0x00);
        assert_eq!(read(&mut serial, UART_RX), 0x01);
        write(&mut serial, UART_LCR, 0x03);
        assert_eq!(read(&mut serial, UART_IER), 0);
        assert!(out.contents().is_empty());

        assert_eq!(read(&mut serial, UART_MSR), 0xb0);
        write(&mut serial, UART_MCR, UART_MCR_LOOP | UART_MCR_OUT2 | UART_MCR_RTS);
        assert_eq!(read(&mut serial, UART_MSR), UART_MSR_DCD | UART_MSR_CTS);
        write(&mut serial, UART_RX, b'z');
        assert_eq!(read(&mut serial, UART_RX), b'z');
        assert!(out.contents().is_empty());

        write(&mut serial, UART_SCR, 0x5a);
        assert_eq!(read(&mut serial, UART_SCR), 0x5a);
    }

    #[test]
    fn wide_reads_zero_extend() {
        let (mut serial, _out, _sink) = serial();
        let mut data = [0xffu8; 4];
        serial.access(UART_LSR, false, &mut data, 2).unwrap();
        assert_eq!(data, [0x60, 0, 0x60, 0]);
        assert_eq!(
            serial.access(UART_LSR, false, &mut [0u8; 3], 2),
            Err(AxError::InvalidInput)
        );
        assert_eq!(
            serial.access(SERIAL_PORT_LEN, false, &mut [0u8], 1),
            Err(AxError::InvalidInput)
        );
    }

    #[test]
    fn reader_thread_feeds_fifo() {
        let input = SerialInput::default();
        let (tx, rx) = mpsc::channel();
        let handle = input
            .clone()
            .spawn_reader(&b"typed"[..], move || {
                let _ = tx.send(());
            })
            .unwrap();
        handle.join().unwrap();
        assert!(rx.try_recv().is_ok());

        let mut got = Vec::new();
        while let Some(b) = input.pop() {
            got.push(b);
        }
        assert_eq!(got, b"typed");
    }
}
