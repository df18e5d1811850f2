//! Lexicographic minimization of fixed-length byte strings.
//!
//! Given a byte string and a condition it satisfies, find a byte string of the same length that is
//! lexicographically no larger and still satisfies the condition. The result is a local minimum,
//! not a global one: it is the best the passes below can reach by zeroing, shifting and
//! binary-searching individual bytes.
//!
//! The condition may fail with an error, which aborts minimization and is returned unchanged.

use std::collections::HashSet;

use byteorder::{BigEndian, ByteOrder};

/// Minimize a single byte value `c` under `f`, assuming `f(c)` holds.
pub fn minimize_byte<E>(c: u8, mut f: impl FnMut(u8) -> Result<bool, E>) -> Result<u8, E> {
    if c == 0 || f(0)? {
        return Ok(0);
    }
    if c == 1 || f(1)? {
        return Ok(1);
    }
    if c == 2 {
        return Ok(2);
    }
    if f(c - 1)? {
        let mut lo = 1;
        let mut hi = c - 1;
        while lo + 1 < hi {
            let mid = lo + (hi - lo) / 2;
            if f(mid)? {
                hi = mid;
            } else {
                lo = mid;
            }
        }
        return Ok(hi);
    }
    Ok(c)
}

pub struct Minimizer<F> {
    current: Vec<u8>,
    size: usize,
    condition: F,
    seen: HashSet<Vec<u8>>,
    changes: usize,
    full: bool,
}

impl<F, E> Minimizer<F>
where
    F: FnMut(&[u8]) -> Result<bool, E>,
{
    /// `full` keeps running the passes until none of them makes progress.
    pub fn new(initial: &[u8], condition: F, full: bool) -> Self {
        let mut seen = HashSet::new();
        seen.insert(initial.to_vec());
        Minimizer {
            current: initial.to_vec(),
            size: initial.len(),
            condition,
            seen,
            changes: 0,
            full,
        }
    }

    pub fn current(&self) -> &[u8] {
        &self.current
    }

    /// Number of successful improvements so far
    pub fn changes(&self) -> usize {
        self.changes
    }

    fn incorporate(&mut self, buffer: &[u8]) -> Result<bool, E> {
        debug_assert_eq!(buffer.len(), self.size);
        if buffer >= self.current.as_slice() || !self.seen.insert(buffer.to_vec()) {
            return Ok(false);
        }
        if (self.condition)(buffer)? {
            self.current = buffer.to_vec();
            self.changes += 1;
            return Ok(true);
        }
        Ok(false)
    }

    pub fn run(mut self) -> Result<Vec<u8>, E> {
        if self.current.iter().all(|&b| b == 0) {
            return Ok(self.current);
        }
        if self.size == 1 {
            for c in 0..self.current[0] {
                if self.incorporate(&[c])? {
                    break;
                }
            }
            return Ok(self.current);
        }

        if self.incorporate(&vec![0; self.size])? {
            return Ok(self.current);
        }
        let mut one = vec![0; self.size];
        one[self.size - 1] = 1;
        if self.incorporate(&one)? {
            return Ok(self.current);
        }

        self.zero_prefix()?;
        self.shift_right()?;

        let mut first = true;
        let mut change_counter = usize::MAX;
        while first || (self.full && change_counter != self.changes) {
            first = false;
            change_counter = self.changes;
            self.shift()?;
            self.shrink_indices()?;
            self.rotate_suffixes()?;
        }
        Ok(self.current)
    }

    /// Binary search for the longest prefix that can be zeroed.
    fn zero_prefix(&mut self) -> Result<(), E> {
        let mut lo = self.current.iter().take_while(|&&b| b == 0).count();
        let mut hi = self.size;
        while lo + 1 < hi {
            let mid = lo + (hi - lo) / 2;
            let mut attempt = self.current.clone();
            attempt[..mid].iter_mut().for_each(|b| *b = 0);
            if self.incorporate(&attempt)? {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Ok(())
    }

    /// Treat short strings as big-endian integers and try dividing by powers of two.
    fn shift_right(&mut self) -> Result<(), E> {
        if self.size > 16 {
            return Ok(());
        }
        let base = BigEndian::read_uint128(&self.current, self.size);
        let bits = 128 - base.leading_zeros();
        for k in 1..bits {
            let mut attempt = vec![0; self.size];
            BigEndian::write_uint128(&mut attempt, base >> k, self.size);
            if self.incorporate(&attempt)? {
                break;
            }
        }
        Ok(())
    }

    /// Shift individual byte values right as far as they go.
    fn shift(&mut self) -> Result<(), E> {
        let mut previous = usize::MAX;
        while previous != self.changes {
            previous = self.changes;
            for i in 0..self.size {
                let c = self.current[i];
                let bits = 8 - c.leading_zeros();
                // c >> bits is zero, which shrink_indices already tries
                for k in (1..bits).rev() {
                    let mut attempt = self.current.clone();
                    attempt[i] = c >> k;
                    if self.incorporate(&attempt)? {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn shrink_indices(&mut self) -> Result<(), E> {
        for i in 0..self.size {
            if self.current[i] == 0 {
                continue;
            }
            let mut zeroed = self.current.clone();
            zeroed[i] = 0;
            if self.incorporate(&zeroed)? {
                continue;
            }

            let prefix = self.current[..i].to_vec();
            let original_suffix = self.current[i + 1..].to_vec();
            let max_suffix = vec![255; original_suffix.len()];
            for suffix in [original_suffix, max_suffix] {
                let start = self.current[i];
                minimize_byte(start, |c| {
                    if c == self.current[i] {
                        return Ok(true);
                    }
                    let mut attempt = prefix.clone();
                    attempt.push(c);
                    attempt.extend_from_slice(&suffix);
                    self.incorporate(&attempt)
                })?;
            }
        }
        Ok(())
    }

    /// Move a suffix in front of the first significant byte.
    fn rotate_suffixes(&mut self) -> Result<(), E> {
        let significant = match self.current.iter().position(|&b| b != 0) {
            Some(significant) => significant,
            None => return Ok(()),
        };
        for i in 1..self.size - significant {
            let left = &self.current[significant..significant + i];
            let right = &self.current[significant + i..];
            let mut rotated = vec![0; significant];
            rotated.extend_from_slice(right);
            rotated.extend_from_slice(left);
            self.incorporate(&rotated)?;
        }
        Ok(())
    }
}

/// Minimize `initial` under `condition`, returning the best byte string found.
pub fn minimize<F, E>(initial: &[u8], condition: F, full: bool) -> Result<Vec<u8>, E>
where
    F: FnMut(&[u8]) -> Result<bool, E>,
{
    Minimizer::new(initial, condition, full).run()
}
