//! End-to-end programming sessions against a simulated STK500v1 bootloader.

use std::cell::RefCell;
use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::rc::Rc;
use std::thread;
use std::time::{Duration, Instant};

use stkflash::protocol::stk500::{RESP_STK_INSYNC, RESP_STK_OK, SYNC_CRC_EOP};
use stkflash::target::board::{SIGNATURE_ATMEGA168, SIGNATURE_ATMEGA328P};
use stkflash::port::READ_POLL_INTERVAL;
use stkflash::{
    BoardProfile, Command, Error, FlashEvent, FlashOptions, HexImage, Port, Step, Stk500Flasher,
    find_board,
};

const RESP_STK_NOSYNC: u8 = 0x15;
const FLASH_SIZE: usize = 32 * 1024;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Simulated bootloader with a flash memory model.
///
/// Replies are queued as the host writes complete command frames, and are
/// handed out in chunks of `chunk_size` bytes per read.
struct SimulatedBootloader {
    signature: [u8; 3],
    memory: Vec<u8>,
    word_address: u16,
    programming: bool,
    incoming: Vec<u8>,
    outgoing: VecDeque<Vec<u8>>,
    chunk_size: usize,
    /// Bytes emitted before the first reply.
    noise: Vec<u8>,
    /// Never answer anything.
    silent: bool,
    /// Ignore this many `Get Sync` commands before answering.
    ignore_syncs: usize,
    /// Flip the byte at this flash offset when it is read back.
    corrupt_at: Option<usize>,
    /// Opcodes in the order received.
    commands: Vec<u8>,
    /// Word addresses from `Load Address`, in order.
    addresses: Vec<u16>,
    /// Data lengths of `Prog Page` commands, in order.
    page_lengths: Vec<usize>,
    /// How long a read blocks when no reply is pending.
    read_timeout: Duration,
}

impl SimulatedBootloader {
    fn new(signature: [u8; 3]) -> Self {
        Self {
            signature,
            memory: vec![0xFF; FLASH_SIZE],
            word_address: 0,
            programming: false,
            incoming: Vec::new(),
            outgoing: VecDeque::new(),
            chunk_size: 64,
            noise: Vec::new(),
            silent: false,
            ignore_syncs: 0,
            corrupt_at: None,
            commands: Vec::new(),
            addresses: Vec::new(),
            page_lengths: Vec::new(),
            read_timeout: Duration::from_millis(1),
        }
    }

    fn uno() -> Self {
        Self::new(SIGNATURE_ATMEGA328P)
    }

    /// Length of the command frame at the start of `incoming`, if complete.
    fn frame_len(&self) -> Option<usize> {
        let opcode = *self.incoming.first()?;
        let len = match opcode {
            0x42 => 22,
            0x55 => 4,
            0x64 | 0x74 => {
                if self.incoming.len() < 4 {
                    return None;
                }
                let data = usize::from(u16::from_be_bytes([self.incoming[1], self.incoming[2]]));
                if opcode == 0x64 { 5 + data } else { 5 }
            },
            _ => 2,
        };
        (self.incoming.len() >= len).then_some(len)
    }

    fn process(&mut self) {
        while let Some(len) = self.frame_len() {
            let frame: Vec<u8> = self.incoming.drain(..len).collect();
            self.commands.push(frame[0]);
            if let Some(reply) = self.handle(&frame) {
                if !self.silent {
                    self.queue_reply(reply);
                }
            }
        }
    }

    fn queue_reply(&mut self, reply: Vec<u8>) {
        let mut bytes = std::mem::take(&mut self.noise);
        bytes.extend(reply);
        for chunk in bytes.chunks(self.chunk_size) {
            self.outgoing.push_back(chunk.to_vec());
        }
    }

    fn handle(&mut self, frame: &[u8]) -> Option<Vec<u8>> {
        if frame.last() != Some(&SYNC_CRC_EOP) {
            return Some(vec![RESP_STK_NOSYNC]);
        }

        let ok = vec![RESP_STK_INSYNC, RESP_STK_OK];
        match frame[0] {
            0x30 => {
                if self.ignore_syncs > 0 {
                    self.ignore_syncs -= 1;
                    None
                } else {
                    Some(ok)
                }
            },
            0x75 => {
                let mut reply = vec![RESP_STK_INSYNC];
                reply.extend_from_slice(&self.signature);
                reply.push(RESP_STK_OK);
                Some(reply)
            },
            0x42 => Some(ok),
            0x50 => {
                self.programming = true;
                Some(ok)
            },
            0x51 => {
                self.programming = false;
                Some(ok)
            },
            0x55 => {
                self.word_address = u16::from_le_bytes([frame[1], frame[2]]);
                self.addresses.push(self.word_address);
                Some(ok)
            },
            0x64 => {
                let data = &frame[4..frame.len() - 1];
                let start = usize::from(self.word_address) * 2;
                self.memory[start..start + data.len()].copy_from_slice(data);
                self.page_lengths.push(data.len());
                Some(ok)
            },
            0x74 => {
                let len = usize::from(u16::from_be_bytes([frame[1], frame[2]]));
                let start = usize::from(self.word_address) * 2;
                let mut reply = vec![RESP_STK_INSYNC];
                reply.extend_from_slice(&self.memory[start..start + len]);
                if let Some(at) = self.corrupt_at {
                    if (start..start + len).contains(&at) {
                        reply[1 + at - start] ^= 0xFF;
                    }
                }
                reply.push(RESP_STK_OK);
                Some(reply)
            },
            _ => Some(vec![RESP_STK_INSYNC, 0x12]),
        }
    }
}

impl Read for SimulatedBootloader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.outgoing.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(buf.len());
                buf[..n].copy_from_slice(&chunk[..n]);
                if n < chunk.len() {
                    self.outgoing.push_front(chunk[n..].to_vec());
                }
                Ok(n)
            },
            None => {
                thread::sleep(self.read_timeout);
                Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
            },
        }
    }
}

impl Write for SimulatedBootloader {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.incoming.extend_from_slice(buf);
        self.process();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SimulatedBootloader {
    fn set_timeout(&mut self, timeout: Duration) -> stkflash::Result<()> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn timeout(&self) -> Duration {
        self.read_timeout
    }

    fn baud_rate(&self) -> u32 {
        115_200
    }

    fn clear_buffers(&mut self) -> stkflash::Result<()> {
        self.outgoing.clear();
        Ok(())
    }

    fn name(&self) -> &str {
        "simulated"
    }

    fn set_dtr(&mut self, _level: bool) -> stkflash::Result<()> {
        Ok(())
    }

    fn set_rts(&mut self, _level: bool) -> stkflash::Result<()> {
        Ok(())
    }

    fn close(&mut self) -> stkflash::Result<()> {
        Ok(())
    }
}

fn options() -> FlashOptions {
    FlashOptions::default().with_timeout(Duration::from_millis(100))
}

#[allow(clippy::cast_possible_truncation)]
fn ramp(len: usize) -> HexImage {
    HexImage::from_bytes((0..len).map(|i| (i * 7 + 3) as u8).collect())
}

fn uno() -> BoardProfile {
    find_board("uno").unwrap()
}

#[test]
fn test_flash_two_pages_end_to_end() {
    init_logger();
    let image = ramp(256);
    let mut device = SimulatedBootloader::uno();

    let report = Stk500Flasher::new(&mut device, uno(), options())
        .flash(&image)
        .unwrap();

    assert_eq!(
        device.commands,
        vec![
            0x30, 0x30, 0x30, // sync x3
            0x75, 0x42, 0x50, // signature, set device, enter progmode
            0x55, 0x64, 0x55, 0x64, // upload
            0x55, 0x74, 0x55, 0x74, // verify
            0x51, // leave progmode
        ]
    );
    assert_eq!(device.addresses, vec![0, 64, 0, 64]);
    assert_eq!(device.page_lengths, vec![128, 128]);
    assert_eq!(&device.memory[..256], image.as_bytes());
    assert!(!device.programming);

    assert_eq!(report.pages, 2);
    assert_eq!(report.bytes_written, 256);
    assert_eq!(report.signature, SIGNATURE_ATMEGA328P.to_vec());

    let steps: Vec<_> = report.timeline.iter().map(|r| r.step).collect();
    assert_eq!(
        steps,
        vec![
            Step::Sync,
            Step::Sync,
            Step::Sync,
            Step::VerifySignature,
            Step::SetOptions,
            Step::EnterProgrammingMode,
            Step::Upload,
            Step::Verify,
            Step::ExitProgrammingMode,
        ]
    );
    assert!(report.timeline.iter().all(|r| r.ok));
}

#[test]
fn test_page_count_and_partial_last_page() {
    let image = ramp(300);
    let mut device = SimulatedBootloader::uno();

    let report = stkflash::flash(&mut device, &image, &uno(), &options()).unwrap();

    assert_eq!(report.pages, 3);
    assert_eq!(device.page_lengths, vec![128, 128, 44]);
    assert_eq!(device.addresses, vec![0, 64, 128, 0, 64, 128]);
    assert_eq!(&device.memory[..300], image.as_bytes());
    assert_eq!(device.memory[300], 0xFF);
}

#[test]
fn test_image_smaller_than_one_page() {
    let image = HexImage::from_bytes(vec![0x0C, 0x94, 0x5C, 0x00, 0x0C, 0x94, 0x6E, 0x00, 0xAA, 0x55]);
    let mut device = SimulatedBootloader::uno();

    let report = stkflash::flash(&mut device, &image, &uno(), &options()).unwrap();

    assert_eq!(report.pages, 1);
    assert_eq!(device.page_lengths, vec![10]);
    assert_eq!(&device.memory[..10], image.as_bytes());
    assert_eq!(device.commands.last(), Some(&0x51));
}

#[test]
fn test_empty_image_skips_page_commands() {
    let mut device = SimulatedBootloader::uno();

    let report = stkflash::flash(&mut device, &HexImage::default(), &uno(), &options()).unwrap();

    assert_eq!(report.pages, 0);
    assert_eq!(device.commands, vec![0x30, 0x30, 0x30, 0x75, 0x42, 0x50, 0x51]);
}

#[test]
fn test_byte_wise_chunks_with_leading_noise() {
    let image = ramp(256);
    let mut device = SimulatedBootloader::uno();
    device.chunk_size = 1;
    device.noise = b"\0\xFFboot".to_vec();

    let report = stkflash::flash(&mut device, &image, &uno(), &options()).unwrap();

    assert_eq!(report.pages, 2);
    assert_eq!(&device.memory[..256], image.as_bytes());
}

#[test]
fn test_silent_device_fails_sync() {
    let mut device = SimulatedBootloader::uno();
    device.silent = true;
    let options = FlashOptions::default().with_timeout(Duration::from_millis(30));

    let err = stkflash::flash(&mut device, &ramp(256), &uno(), &options).unwrap_err();

    assert_eq!(err.step(), Some(Step::Sync));
    assert!(matches!(err.root_cause(), Error::SyncExhausted { attempts: 3, .. }));
    // Three attempts of the first handshake, nothing after.
    assert_eq!(device.commands, vec![0x30, 0x30, 0x30]);
}

#[test]
fn test_slow_port_read_timeout_does_not_stretch_deadline() {
    let mut device = SimulatedBootloader::uno();
    device.silent = true;
    device.read_timeout = Duration::from_millis(500);
    let options = FlashOptions::default()
        .with_timeout(Duration::from_millis(50))
        .with_sync_attempts(1);

    let started = Instant::now();
    let err = stkflash::flash(&mut device, &ramp(64), &uno(), &options).unwrap_err();

    assert!(started.elapsed() < Duration::from_millis(300));
    match err.root_cause() {
        Error::SyncExhausted { attempts: 1, source } => {
            assert!(matches!(source.root_cause(), Error::Timeout { .. }));
        },
        other => panic!("unexpected error: {other}"),
    }
    // The caller's read timeout is restored after the session.
    assert_eq!(device.timeout(), Duration::from_millis(500));
}

#[test]
fn test_fast_port_read_timeout_is_kept() {
    let mut device = SimulatedBootloader::uno();
    device.read_timeout = Duration::from_millis(2);
    assert!(device.timeout() < READ_POLL_INTERVAL);

    stkflash::flash(&mut device, &ramp(64), &uno(), &options()).unwrap();

    assert_eq!(device.timeout(), Duration::from_millis(2));
}

#[test]
fn test_reset_then_flash_over_port() {
    let mut device = SimulatedBootloader::uno();
    device.outgoing.push_back(b"stale".to_vec());

    stkflash::reset_board(&mut device).unwrap();
    let report = stkflash::flash(&mut device, &ramp(64), &uno(), &options()).unwrap();

    assert_eq!(report.pages, 1);
}

#[test]
fn test_image_larger_than_board_flash_is_rejected() {
    let mut device = SimulatedBootloader::uno();
    let image = HexImage::from_bytes(vec![0xFF; FLASH_SIZE + 2]);

    let err = stkflash::flash(&mut device, &image, &uno(), &options()).unwrap_err();

    assert!(matches!(err, Error::InvalidImage(_)));
    assert!(device.commands.is_empty());
}

#[test]
fn test_sync_recovers_within_attempt_budget() {
    let mut device = SimulatedBootloader::uno();
    device.ignore_syncs = 2;
    let options = FlashOptions::default().with_timeout(Duration::from_millis(30));

    stkflash::flash(&mut device, &ramp(64), &uno(), &options).unwrap();

    // 2 ignored + 3 answered handshakes
    let syncs = device.commands.iter().filter(|&&op| op == 0x30).count();
    assert_eq!(syncs, 5);
}

#[test]
fn test_sync_attempt_budget_is_configurable() {
    let mut device = SimulatedBootloader::uno();
    device.ignore_syncs = 2;
    let options = FlashOptions::default()
        .with_timeout(Duration::from_millis(30))
        .with_sync_attempts(2);

    let err = stkflash::flash(&mut device, &ramp(64), &uno(), &options).unwrap_err();

    assert!(matches!(err.root_cause(), Error::SyncExhausted { attempts: 2, .. }));
}

#[test]
fn test_verify_detects_corrupted_byte() {
    let image = ramp(256);
    let mut device = SimulatedBootloader::uno();
    device.corrupt_at = Some(130);

    let err = stkflash::flash(&mut device, &image, &uno(), &options()).unwrap_err();

    assert_eq!(err.step(), Some(Step::Verify));
    match err.root_cause() {
        Error::ResponseMismatch {
            command,
            expected,
            actual,
        } => {
            assert_eq!(*command, Command::ReadPage);
            assert_eq!(expected.len(), 130);
            assert_ne!(expected[3], actual[3]);
        },
        other => panic!("unexpected error: {other}"),
    }
    // Programming mode is not left after a failed step.
    assert_eq!(device.commands.last(), Some(&0x74));
    assert!(device.programming);
}

#[test]
fn test_signature_mismatch_only_when_checked() {
    let board = find_board("nano-old").unwrap();

    let mut device = SimulatedBootloader::new(SIGNATURE_ATMEGA168);
    let report = stkflash::flash(&mut device, &ramp(64), &board, &options()).unwrap();
    assert_eq!(report.signature, SIGNATURE_ATMEGA168.to_vec());

    let mut device = SimulatedBootloader::new(SIGNATURE_ATMEGA168);
    let options = options().with_check_signature(true);
    let err = stkflash::flash(&mut device, &ramp(64), &board, &options).unwrap_err();

    assert_eq!(err.step(), Some(Step::VerifySignature));
    assert!(matches!(err.root_cause(), Error::SignatureMismatch { .. }));
    assert_eq!(device.commands, vec![0x30, 0x30, 0x30, 0x75]);
}

#[test]
fn test_observer_sees_steps_and_pages() {
    let events = Rc::new(RefCell::new(Vec::new()));
    let sink = Rc::clone(&events);
    let mut device = SimulatedBootloader::uno();

    Stk500Flasher::new(&mut device, uno(), options())
        .with_observer(move |event: &FlashEvent<'_>| {
            let label = match event {
                FlashEvent::StepStarted(step) => format!("start {step}"),
                FlashEvent::StepSucceeded { step, .. } => format!("ok {step}"),
                FlashEvent::StepFailed { step, .. } => format!("fail {step}"),
                FlashEvent::Page {
                    step, offset, len, ..
                } => format!("{step} {offset}+{len}"),
            };
            sink.borrow_mut().push(label);
        })
        .flash(&ramp(256))
        .unwrap();

    let events = events.borrow();
    assert_eq!(events.first().map(String::as_str), Some("start sync"));
    assert_eq!(events.last().map(String::as_str), Some("ok exit programming mode"));
    assert!(events.contains(&"upload 128+128".to_string()));
    assert!(events.contains(&"verify 0+128".to_string()));
    assert!(!events.iter().any(|e| e.starts_with("fail")));
}

#[test]
fn test_observer_sees_failure() {
    let failed = Rc::new(RefCell::new(None));
    let sink = Rc::clone(&failed);
    let mut device = SimulatedBootloader::uno();
    device.silent = true;
    let options = FlashOptions::default().with_timeout(Duration::from_millis(20));

    let result = Stk500Flasher::new(&mut device, uno(), options)
        .with_observer(move |event: &FlashEvent<'_>| {
            if let FlashEvent::StepFailed { step, error } = event {
                *sink.borrow_mut() = Some((*step, error.to_string()));
            }
        })
        .flash(&ramp(16));

    assert!(result.is_err());
    let (step, message) = failed.borrow().clone().unwrap();
    assert_eq!(step, Step::Sync);
    assert!(message.contains("3 attempts"));
}

#[test]
fn test_individual_steps() {
    let mut device = SimulatedBootloader::uno();
    let image = ramp(200);
    let mut flasher = Stk500Flasher::new(&mut device, uno(), options());

    flasher.sync().unwrap();
    assert_eq!(flasher.verify_signature().unwrap(), SIGNATURE_ATMEGA328P.to_vec());
    flasher.set_options().unwrap();
    flasher.enter_programming_mode().unwrap();
    assert_eq!(flasher.upload(&image).unwrap(), 2);
    assert_eq!(flasher.verify(&image).unwrap(), 2);
    flasher.exit_programming_mode().unwrap();

    let device = flasher.into_transport();
    assert_eq!(&device.memory[..200], image.as_bytes());
}
