use std::io::{BufRead, Write};
use std::num::{IntErrorKind, ParseIntError};
use std::time::Duration;

use crate::error::{Error, Result};

/// Upper bound on forked tasks per run.
pub const MAX_PROCESSES: u64 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Processes,
    WriteRate,
    Duration,
}

impl Field {
    pub const ORDER: [Field; 3] = [Field::Processes, Field::WriteRate, Field::Duration];

    pub fn name(self) -> &'static str {
        match self {
            Field::Processes => "process count",
            Field::WriteRate => "write rate",
            Field::Duration => "duration",
        }
    }

    pub fn prompt(self) -> &'static str {
        match self {
            Field::Processes => "Enter the number of processes: ",
            Field::WriteRate => "Enter the write rate (writes per second) for the first process: ",
            Field::Duration => "Enter the duration of the test (seconds): ",
        }
    }

    fn max(self) -> u64 {
        match self {
            Field::Processes => MAX_PROCESSES,
            Field::WriteRate | Field::Duration => u64::from(u32::MAX),
        }
    }

    /// Parse and range-check one value. Everything must be a positive
    /// integer.
    pub fn parse(self, raw: &str) -> Result<u64> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(Error::invalid(self.name(), "no value given"));
        }
        let value: i64 = raw.parse().map_err(|e: ParseIntError| match e.kind() {
            IntErrorKind::PosOverflow => Error::invalid(
                self.name(),
                format!("must be at most {}, got {raw}", self.max()),
            ),
            IntErrorKind::NegOverflow => Error::invalid(
                self.name(),
                format!("must be greater than zero, got {raw}"),
            ),
            _ => Error::invalid(self.name(), format!("{raw:?} is not an integer")),
        })?;
        if value <= 0 {
            return Err(Error::invalid(
                self.name(),
                format!("must be greater than zero, got {value}"),
            ));
        }
        let value = value as u64;
        if value > self.max() {
            return Err(Error::invalid(
                self.name(),
                format!("must be at most {}, got {value}", self.max()),
            ));
        }
        Ok(value)
    }
}

/// Validated parameters shared by both runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunParams {
    pub processes: usize,
    pub write_rate: u32,
    pub duration: Duration,
}

impl RunParams {
    pub fn from_raw(processes: &str, write_rate: &str, duration: &str) -> Result<Self> {
        Ok(RunParams {
            processes: Field::Processes.parse(processes)? as usize,
            write_rate: Field::WriteRate.parse(write_rate)? as u32,
            duration: Duration::from_secs(Field::Duration.parse(duration)?),
        })
    }

    /// Take values given up front, prompting on `output` and reading from
    /// `input` for the missing ones, in the fixed order process count, write
    /// rate, duration.
    pub fn resolve<R: BufRead, W: Write>(
        given: [Option<String>; 3],
        input: &mut R,
        output: &mut W,
    ) -> Result<Self> {
        let mut values: [String; 3] = Default::default();
        for ((field, given), slot) in Field::ORDER.into_iter().zip(given).zip(values.iter_mut()) {
            *slot = match given {
                Some(v) => v,
                None => prompt(field, input, output)?,
            };
            // Fail on the first bad value instead of asking for the rest.
            field.parse(slot.as_str())?;
        }
        let [processes, write_rate, duration] = values;
        RunParams::from_raw(&processes, &write_rate, &duration)
    }
}

fn prompt<R: BufRead, W: Write>(field: Field, input: &mut R, output: &mut W) -> Result<String> {
    output.write_all(field.prompt().as_bytes())?;
    output.flush()?;
    let mut line = String::new();
    if input.read_line(&mut line)? == 0 {
        return Err(Error::invalid(field.name(), "input ended before a value was given"));
    }
    Ok(line)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn parses_positive_integers() {
        let params = RunParams::from_raw("3", "10", "2").unwrap();
        assert_eq!(
            params,
            RunParams {
                processes: 3,
                write_rate: 10,
                duration: Duration::from_secs(2),
            }
        );
    }

    #[test]
    fn rejects_zero_and_negative() {
        for raw in ["0", "-1", "-300"] {
            let err = Field::Processes.parse(raw).unwrap_err();
            assert!(matches!(err, Error::InvalidInput { field: "process count", .. }));
        }
        assert!(Field::WriteRate.parse("0").is_err());
        assert!(Field::Duration.parse("-5").is_err());
    }

    #[test]
    fn rejects_non_integers() {
        for raw in ["", "abc", "1.5", "3x"] {
            assert!(Field::Duration.parse(raw).is_err(), "{raw:?} accepted");
        }
    }

    #[test]
    fn rejects_out_of_range() {
        assert!(Field::Processes.parse("1025").is_err());
        assert!(Field::WriteRate.parse("4294967296").is_err());
        assert_eq!(Field::WriteRate.parse("4294967295").unwrap(), u64::from(u32::MAX));
    }

    #[test]
    fn oversized_integers_are_range_errors() {
        let err = Field::Processes.parse("99999999999999999999").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid process count: must be at most 1024, got 99999999999999999999"
        );

        let err = Field::Duration.parse("-99999999999999999999").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid duration: must be greater than zero, got -99999999999999999999"
        );
    }

    #[test]
    fn error_message_names_field() {
        let err = Field::WriteRate.parse("-2").unwrap_err();
        assert_eq!(
            err.to_string(),
            "invalid write rate: must be greater than zero, got -2"
        );
    }

    #[test]
    fn prompts_in_order() {
        let mut input = Cursor::new("4\n100\n3\n");
        let mut output = Vec::new();
        let params = RunParams::resolve([None, None, None], &mut input, &mut output).unwrap();

        assert_eq!(params.processes, 4);
        assert_eq!(params.write_rate, 100);
        assert_eq!(params.duration, Duration::from_secs(3));

        let shown = String::from_utf8(output).unwrap();
        let expected: String = Field::ORDER.iter().map(|f| f.prompt()).collect();
        assert_eq!(shown, expected);
    }

    #[test]
    fn only_prompts_for_missing() {
        let mut input = Cursor::new("7\n");
        let mut output = Vec::new();
        let params = RunParams::resolve(
            [Some("2".into()), None, Some("1".into())],
            &mut input,
            &mut output,
        )
        .unwrap();

        assert_eq!(params.write_rate, 7);
        assert_eq!(String::from_utf8(output).unwrap(), Field::WriteRate.prompt());
    }

    #[test]
    fn stops_at_first_bad_value() {
        let mut input = Cursor::new("0\n10\n2\n");
        let mut output = Vec::new();
        let err = RunParams::resolve([None, None, None], &mut input, &mut output).unwrap_err();
        assert!(matches!(err, Error::InvalidInput { field: "process count", .. }));
        assert_eq!(String::from_utf8(output).unwrap(), Field::Processes.prompt());
    }

    #[test]
    fn eof_is_an_input_error() {
        let mut input = Cursor::new("");
        let mut output = Vec::new();
        let err = RunParams::resolve([None, None, None], &mut input, &mut output).unwrap_err();
        assert!(matches!(err, Error::InvalidInput { .. }));
    }
}
