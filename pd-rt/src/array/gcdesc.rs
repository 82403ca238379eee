use rt_abi::{
    GCDESC_COUNT_SIZE, GCDESC_MAX_PATTERN_FIELD, GCDESC_PATTERN_ITEM_SIZE, GCDESC_SERIES_SIZE,
    OBJ_HEADER_SIZE, POINTER_SIZE,
};
use serde::Serialize;

use crate::error::{GcDescError, TypeLoadError};
use crate::types::TypeDesc;

/// `covered = size_delta + object_size` bytes of references starting at
/// `start`, both relative to the object pointer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct GcSeries {
    pub start: u64,
    pub size_delta: i64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct PatternItem {
    pub nptrs: u16,
    pub skip: u16,
}

/// Where the references of an instance live, in the form the collector
/// scans. Arrays of value types use the repeating form, whose items are
/// cycled until the end of the object.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GcDesc {
    Empty,
    Series(Vec<GcSeries>),
    Repeating { start: u64, items: Vec<PatternItem> },
}

impl GcDesc {
    /// Describes an array whose elements of `component_size` bytes begin at
    /// `data_offset` in an object whose fixed part is `base_size` bytes.
    pub fn for_array(
        element: &TypeDesc,
        data_offset: u32,
        base_size: u32,
        component_size: u32,
    ) -> Result<Self, TypeLoadError> {
        if element.is_reference() {
            return Ok(GcDesc::Series(vec![GcSeries {
                start: u64::from(data_offset),
                size_delta: -i64::from(base_size),
            }]));
        }
        let Some(layout) = element.value_layout() else {
            return Ok(GcDesc::Empty);
        };
        if !layout.contains_references() {
            return Ok(GcDesc::Empty);
        }

        let runs = pointer_runs(element, &layout.ref_offsets, component_size)?;
        let first_start = runs[0].0;
        let mut items = Vec::with_capacity(runs.len());
        for (index, (start, nptrs)) in runs.iter().enumerate() {
            let run_end = start + nptrs * POINTER_SIZE;
            let next_start = match runs.get(index + 1) {
                Some((next, _)) => *next,
                // wraps into the next element
                None => component_size + first_start,
            };
            let skip = next_start - run_end;
            if *nptrs > GCDESC_MAX_PATTERN_FIELD || skip > GCDESC_MAX_PATTERN_FIELD {
                return Err(TypeLoadError::SeriesTooComplex {
                    element: element.id,
                });
            }
            items.push(PatternItem {
                nptrs: *nptrs as u16,
                skip: skip as u16,
            });
        }
        Ok(GcDesc::Repeating {
            start: u64::from(data_offset + first_start),
            items,
        })
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, GcDesc::Empty)
    }

    /// The signed series count that leads the encoded form.
    pub fn count(&self) -> i64 {
        match self {
            GcDesc::Empty => 0,
            GcDesc::Series(series) => series.len() as i64,
            GcDesc::Repeating { items, .. } => -(items.len() as i64),
        }
    }

    pub fn encoded_len(&self) -> usize {
        GCDESC_COUNT_SIZE
            + match self {
                GcDesc::Empty => 0,
                GcDesc::Series(series) => series.len() * GCDESC_SERIES_SIZE,
                GcDesc::Repeating { items, .. } => 8 + items.len() * GCDESC_PATTERN_ITEM_SIZE,
            }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&self.count().to_le_bytes());
        match self {
            GcDesc::Empty => {}
            GcDesc::Series(series) => {
                for entry in series {
                    out.extend_from_slice(&entry.start.to_le_bytes());
                    out.extend_from_slice(&entry.size_delta.to_le_bytes());
                }
            }
            GcDesc::Repeating { start, items } => {
                out.extend_from_slice(&start.to_le_bytes());
                for item in items {
                    out.extend_from_slice(&item.nptrs.to_le_bytes());
                    out.extend_from_slice(&item.skip.to_le_bytes());
                }
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, GcDescError> {
        let mut reader = Reader { bytes, pos: 0 };
        let count = reader.i64()?;
        let desc = match count {
            0 => GcDesc::Empty,
            count if count > 0 => {
                let count = reader.checked_count(count, GCDESC_SERIES_SIZE)?;
                let mut series = Vec::with_capacity(count);
                for _ in 0..count {
                    series.push(GcSeries {
                        start: reader.u64()?,
                        size_delta: reader.i64()?,
                    });
                }
                GcDesc::Series(series)
            }
            count => {
                let magnitude = count.checked_neg().ok_or(GcDescError::BadCount(count))?;
                let start = reader.u64()?;
                let magnitude = reader.checked_count(magnitude, GCDESC_PATTERN_ITEM_SIZE)?;
                let mut items = Vec::with_capacity(magnitude);
                for _ in 0..magnitude {
                    items.push(PatternItem {
                        nptrs: reader.u16()?,
                        skip: reader.u16()?,
                    });
                }
                GcDesc::Repeating { start, items }
            }
        };
        if reader.pos != bytes.len() {
            return Err(GcDescError::TrailingBytes);
        }
        Ok(desc)
    }

    /// Walks the descriptor the way the collector does and returns every
    /// reference slot offset for an object of `object_size` bytes.
    pub fn pointer_offsets(&self, object_size: u64) -> Vec<u64> {
        let limit = object_size.saturating_sub(u64::from(OBJ_HEADER_SIZE));
        let word = u64::from(POINTER_SIZE);
        let mut offsets = Vec::new();
        match self {
            GcDesc::Empty => {}
            GcDesc::Series(series) => {
                for entry in series {
                    let covered = entry.size_delta + object_size as i64;
                    if covered <= 0 {
                        continue;
                    }
                    let end = entry.start + covered as u64;
                    offsets.extend((entry.start..end).step_by(word as usize));
                }
            }
            GcDesc::Repeating { start, items } => {
                if items.iter().all(|item| item.nptrs == 0 && item.skip == 0) {
                    return offsets;
                }
                let mut cursor = *start;
                'walk: loop {
                    for item in items {
                        for _ in 0..item.nptrs {
                            if cursor >= limit {
                                break 'walk;
                            }
                            offsets.push(cursor);
                            cursor += word;
                        }
                        cursor += u64::from(item.skip);
                        if cursor >= limit {
                            break 'walk;
                        }
                    }
                }
            }
        }
        offsets
    }
}

/// Collapses sorted reference offsets into `(start, count)` runs of
/// adjacent pointer slots.
fn pointer_runs(
    element: &TypeDesc,
    offsets: &[u32],
    component_size: u32,
) -> Result<Vec<(u32, u32)>, TypeLoadError> {
    let invalid = |reason| TypeLoadError::InvalidGcLayout {
        element: element.id,
        reason,
    };
    let mut runs: Vec<(u32, u32)> = Vec::new();
    let mut previous: Option<u32> = None;
    for &offset in offsets {
        if offset % POINTER_SIZE != 0 {
            return Err(invalid("reference offset is not pointer aligned"));
        }
        if previous.is_some_and(|prev| offset <= prev) {
            return Err(invalid("reference offsets are not strictly increasing"));
        }
        if offset
            .checked_add(POINTER_SIZE)
            .is_none_or(|end| end > component_size)
        {
            return Err(invalid("reference offset lies outside the value"));
        }
        match runs.last_mut() {
            Some((start, count)) if *start + *count * POINTER_SIZE == offset => *count += 1,
            _ => runs.push((offset, 1)),
        }
        previous = Some(offset);
    }
    Ok(runs)
}

struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl Reader<'_> {
    fn take<const N: usize>(&mut self) -> Result<[u8; N], GcDescError> {
        let end = self.pos.checked_add(N).ok_or(GcDescError::UnexpectedEof)?;
        let slice = self
            .bytes
            .get(self.pos..end)
            .ok_or(GcDescError::UnexpectedEof)?;
        self.pos = end;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn i64(&mut self) -> Result<i64, GcDescError> {
        self.take::<8>().map(i64::from_le_bytes)
    }

    fn u64(&mut self) -> Result<u64, GcDescError> {
        self.take::<8>().map(u64::from_le_bytes)
    }

    fn u16(&mut self) -> Result<u16, GcDescError> {
        self.take::<2>().map(u16::from_le_bytes)
    }

    // Rejects counts the remaining input cannot possibly hold before
    // anything is allocated for them.
    fn checked_count(&self, count: i64, item_size: usize) -> Result<usize, GcDescError> {
        let remaining = (self.bytes.len() - self.pos) / item_size;
        usize::try_from(count)
            .ok()
            .filter(|count| *count <= remaining)
            .ok_or(if usize::try_from(count).is_ok() {
                GcDescError::UnexpectedEof
            } else {
                GcDescError::BadCount(count)
            })
    }
}
