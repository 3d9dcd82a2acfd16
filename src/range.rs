//! 单段 `Range: bytes=` 请求头解析。

/// 闭区间 `[start, end]`。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("malformed range header")]
    Malformed,
    #[error("range outside of resource")]
    Unsatisfiable,
}

/// 解析 `bytes=start-end`、`bytes=start-`、`bytes=-suffix`；不支持多段。
pub fn parse_range(value: &str, file_size: u64) -> Result<ByteRange, RangeError> {
    let value = value.trim();
    let Some(spec) = value
        .get(..6)
        .filter(|unit| unit.eq_ignore_ascii_case("bytes="))
        .map(|_| &value[6..])
    else {
        return Err(RangeError::Malformed);
    };
    if spec.contains(',') {
        return Err(RangeError::Malformed);
    }
    let Some((start_part, end_part)) = spec.split_once('-') else {
        return Err(RangeError::Malformed);
    };
    let (start_part, end_part) = (start_part.trim(), end_part.trim());

    if file_size == 0 {
        return Err(RangeError::Unsatisfiable);
    }
    let last = file_size - 1;

    if start_part.is_empty() {
        let suffix = parse_bound(end_part)?;
        if suffix == 0 {
            return Err(RangeError::Unsatisfiable);
        }
        return Ok(ByteRange {
            start: file_size.saturating_sub(suffix),
            end: last,
        });
    }

    let start = parse_bound(start_part)?;
    let end = if end_part.is_empty() {
        last
    } else {
        parse_bound(end_part)?
    };
    if start > end {
        return Err(RangeError::Malformed);
    }
    if start >= file_size || end >= file_size {
        return Err(RangeError::Unsatisfiable);
    }
    Ok(ByteRange { start, end })
}

fn parse_bound(value: &str) -> Result<u64, RangeError> {
    if value.is_empty() || !value.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(RangeError::Malformed);
    }
    value.parse::<u64>().map_err(|_| RangeError::Malformed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_range() {
        assert_eq!(
            parse_range("bytes=100-199", 1000),
            Ok(ByteRange { start: 100, end: 199 })
        );
        assert_eq!(parse_range("bytes=100-199", 1000).map(|r| r.len()), Ok(100));
    }

    #[test]
    fn open_end_is_clamped_to_last_byte() {
        assert_eq!(
            parse_range("bytes=500-", 1000),
            Ok(ByteRange { start: 500, end: 999 })
        );
        assert_eq!(
            parse_range("bytes=0-", 1),
            Ok(ByteRange { start: 0, end: 0 })
        );
    }

    #[test]
    fn suffix_range() {
        assert_eq!(
            parse_range("bytes=-100", 1000),
            Ok(ByteRange { start: 900, end: 999 })
        );
        assert_eq!(
            parse_range("bytes=-5000", 1000),
            Ok(ByteRange { start: 0, end: 999 })
        );
        assert_eq!(parse_range("bytes=-0", 1000), Err(RangeError::Unsatisfiable));
    }

    #[test]
    fn out_of_bounds_is_unsatisfiable() {
        assert_eq!(
            parse_range("bytes=2000-2100", 1000),
            Err(RangeError::Unsatisfiable)
        );
        assert_eq!(
            parse_range("bytes=900-1000", 1000),
            Err(RangeError::Unsatisfiable)
        );
        assert_eq!(parse_range("bytes=0-", 0), Err(RangeError::Unsatisfiable));
    }

    #[test]
    fn malformed_headers() {
        for value in [
            "bytes=0-1,5-6",
            "items=0-1",
            "bytes=abc-",
            "bytes=",
            "bytes=5",
            "bytes=10-5",
            "bytes=-",
            "bytes=+1-2",
            "",
        ] {
            assert_eq!(parse_range(value, 1000), Err(RangeError::Malformed), "{value}");
        }
    }
}
