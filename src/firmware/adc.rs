// Round-robin ADC scheduling
//
// Up to eight (channel, kind, listener) reads share one converter. After a
// conversion completes the result goes to its listener, then the scheduler
// idles for `interval` polls before starting the next read.

use heapless::Vec as BoundedVec;
use tracing::trace;

use crate::config::{DEFAULT_ADC_INTERVAL, MAX_ADC_READS};

/// What a conversion measures, so one listener can own several reads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdcKind {
    Current,
    Position,
}

/// A converter that runs one conversion at a time
pub trait AdcConverter {
    fn start(&mut self, channel: u8);

    /// Result of the running conversion once it has finished
    fn poll_result(&mut self) -> Option<u16>;
}

/// Receives conversions for listener key `L`
pub trait AdcSink<L> {
    fn on_adc(&mut self, listener: L, kind: AdcKind, raw: u16);
}

#[derive(Debug, thiserror::Error)]
#[error("ADC read table full ({max} reads)")]
pub struct AdcTableFull {
    pub max: usize,
}

#[derive(Debug, Clone, Copy)]
struct AdcRead<L> {
    channel: u8,
    kind: AdcKind,
    listener: L,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AdcState {
    Idle,
    Waiting,
    Countdown(u16),
}

pub struct AdcScheduler<C, L> {
    converter: C,
    reads: BoundedVec<AdcRead<L>, MAX_ADC_READS>,
    current: usize,
    state: AdcState,
    interval: u16,
    conversions: u32,
}

impl<C: AdcConverter, L: Copy> AdcScheduler<C, L> {
    pub fn new(converter: C) -> Self {
        Self {
            converter,
            reads: BoundedVec::new(),
            current: 0,
            state: AdcState::Idle,
            interval: DEFAULT_ADC_INTERVAL,
            conversions: 0,
        }
    }

    pub fn add_read(&mut self, channel: u8, kind: AdcKind, listener: L) -> Result<(), AdcTableFull> {
        self.reads
            .push(AdcRead {
                channel,
                kind,
                listener,
            })
            .map_err(|_| AdcTableFull { max: MAX_ADC_READS })
    }

    /// Polls to idle between conversions
    pub fn set_interval(&mut self, polls: u16) {
        self.interval = polls;
    }

    /// Completed conversions, for diagnostics
    pub fn conversions(&self) -> u32 {
        self.conversions
    }

    pub fn converter_mut(&mut self) -> &mut C {
        &mut self.converter
    }

    fn start_current(&mut self) {
        if let Some(read) = self.reads.get(self.current) {
            self.converter.start(read.channel);
            self.state = AdcState::Waiting;
        }
    }

    /// Advance the cycle by one main-loop pass
    pub fn poll<S: AdcSink<L>>(&mut self, sink: &mut S) {
        match self.state {
            AdcState::Idle => self.start_current(),
            AdcState::Waiting => {
                let Some(raw) = self.converter.poll_result() else {
                    return;
                };
                if let Some(read) = self.reads.get(self.current).copied() {
                    trace!("ADC channel {} -> {}", read.channel, raw);
                    self.conversions = self.conversions.wrapping_add(1);
                    sink.on_adc(read.listener, read.kind, raw);
                }
                self.current = (self.current + 1) % self.reads.len().max(1);
                self.state = AdcState::Countdown(self.interval);
            }
            AdcState::Countdown(0) => self.start_current(),
            AdcState::Countdown(n) => self.state = AdcState::Countdown(n - 1),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Converter that finishes each conversion on the next poll with a
    /// per-channel value
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedConverter {
        pub values: [u16; 8],
        pub started: VecDeque<u8>,
        pending: Option<u8>,
    }

    impl AdcConverter for ScriptedConverter {
        fn start(&mut self, channel: u8) {
            self.started.push_back(channel);
            self.pending = Some(channel);
        }

        fn poll_result(&mut self) -> Option<u16> {
            self.pending.take().map(|ch| self.values[ch as usize])
        }
    }

    #[derive(Default)]
    struct Collect(Vec<(usize, AdcKind, u16)>);

    impl AdcSink<usize> for Collect {
        fn on_adc(&mut self, listener: usize, kind: AdcKind, raw: u16) {
            self.0.push((listener, kind, raw));
        }
    }

    #[test]
    fn test_round_robin_with_countdown() {
        let mut conv = ScriptedConverter::default();
        conv.values[2] = 500;
        conv.values[5] = 77;
        let mut adc = AdcScheduler::new(conv);
        adc.set_interval(2);
        adc.add_read(2, AdcKind::Current, 0).unwrap();
        adc.add_read(5, AdcKind::Position, 1).unwrap();

        let mut sink = Collect::default();
        // start, complete, 2 countdown polls, countdown 0 -> start, complete
        for _ in 0..6 {
            adc.poll(&mut sink);
        }
        assert_eq!(
            sink.0,
            vec![(0, AdcKind::Current, 500), (1, AdcKind::Position, 77)]
        );
        assert_eq!(adc.conversions(), 2);
        assert_eq!(adc.converter_mut().started, VecDeque::from([2, 5]));
    }

    #[test]
    fn test_table_is_bounded() {
        let mut adc: AdcScheduler<ScriptedConverter, usize> = AdcScheduler::new(ScriptedConverter::default());
        for i in 0..MAX_ADC_READS {
            adc.add_read(i as u8, AdcKind::Current, i).unwrap();
        }
        assert!(adc.add_read(0, AdcKind::Current, 99).is_err());
    }

    #[test]
    fn test_no_reads_is_harmless() {
        let mut adc: AdcScheduler<ScriptedConverter, usize> = AdcScheduler::new(ScriptedConverter::default());
        let mut sink = Collect::default();
        for _ in 0..5 {
            adc.poll(&mut sink);
        }
        assert!(sink.0.is_empty());
    }
}
