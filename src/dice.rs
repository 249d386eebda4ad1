use std::collections::VecDeque;
use std::sync::Mutex;

use rand::RngCore;
use rand::rngs::OsRng;

use crate::domain::{DiceSource, Error};

/// Rolls from the operating system's CSPRNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsDice;

impl OsDice {
    fn roll_one(&self) -> Result<u8, Error> {
        let mut byte = [0u8; 1];
        loop {
            OsRng
                .try_fill_bytes(&mut byte)
                .map_err(|e| Error::Store(format!("dice source unavailable: {}", e)))?;
            // 252 is the largest multiple of 6 below 256.
            if byte[0] < 252 {
                return Ok(byte[0] % 6 + 1);
            }
        }
    }
}

impl DiceSource for OsDice {
    fn roll(&self, count: usize) -> Result<Vec<u8>, Error> {
        (0..count).map(|_| self.roll_one()).collect()
    }
}

/// Faces handed over by the chat transport, consumed in order. Once the
/// queue runs dry the remaining faces come from [`OsDice`].
#[derive(Debug, Default)]
pub struct QueuedDice {
    queue: Mutex<VecDeque<u8>>,
    fallback: OsDice,
}

impl QueuedDice {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, faces: &[u8]) -> Result<(), Error> {
        if let Some(face) = faces.iter().find(|f| !(1..=6).contains(*f)) {
            return Err(Error::Validation(format!("die face {} is out of range", face)));
        }
        self.queue
            .lock()
            .map_err(|_| Error::Store("dice queue lock poisoned".to_string()))?
            .extend(faces.iter().copied());
        Ok(())
    }

    /// Drops faces a failed join left behind.
    pub fn clear(&self) {
        if let Ok(mut queue) = self.queue.lock() {
            queue.clear();
        }
    }

    pub fn queued(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }
}

impl DiceSource for QueuedDice {
    fn roll(&self, count: usize) -> Result<Vec<u8>, Error> {
        let mut faces: Vec<u8> = {
            let mut queue = self
                .queue
                .lock()
                .map_err(|_| Error::Store("dice queue lock poisoned".to_string()))?;
            let take = count.min(queue.len());
            queue.drain(..take).collect()
        };
        if faces.len() < count {
            faces.extend(self.fallback.roll(count - faces.len())?);
        }
        Ok(faces)
    }
}
