//! Property tests for command-line splitting, template rendering and
//! datetime parsing.

use chrono::{NaiveDate, Timelike};
use proptest::prelude::*;

use winrm_client::response::parse_datetime;
use winrm_client::shell::split_command_line;
use winrm_client::templates::TemplateStore;

proptest! {
    #[test]
    fn split_recovers_plain_tokens(tokens in prop::collection::vec("[A-Za-z0-9_./:%\\\\-]{1,12}", 1..8)) {
        let line = tokens.join("  ");
        prop_assert_eq!(split_command_line(&line).unwrap(), tokens);
    }

    #[test]
    fn quoted_token_is_kept_whole(inner in "[A-Za-z0-9 _%\\\\]{0,20}") {
        let line = format!("typeperf \"{}\" -sc 1", inner);
        let parts = split_command_line(&line).unwrap();
        prop_assert_eq!(parts.len(), 4);
        prop_assert_eq!(&parts[1], &format!("\"{}\"", inner));
    }

    #[test]
    fn rendered_values_are_never_rescanned(shell_id in "\\{[a-z_]{1,10}\\}") {
        let store = TemplateStore::default();
        let rendered = store
            .render(
                "delete",
                &[
                    ("url", "http://win01:5985/wsman"),
                    ("message_id", "00000000-0000-0000-0000-000000000000"),
                    ("envelope_size", "512000"),
                    ("locale", "en-US"),
                    ("shell_id", shell_id.as_str()),
                ],
            )
            .unwrap();
        let expected = format!("<w:Selector Name=\"ShellId\">{}</w:Selector>", shell_id);
        prop_assert!(rendered.contains(&expected));
    }

    #[test]
    fn fractions_truncate_to_microseconds(nanos in 0u32..1_000_000_000) {
        let text = format!("2013-04-09T15:42:20.{:09}Z", nanos);
        let parsed = parse_datetime(&text).unwrap();
        prop_assert_eq!(parsed.date(), NaiveDate::from_ymd_opt(2013, 4, 9).unwrap());
        prop_assert_eq!(parsed.nanosecond(), nanos - nanos % 1_000);
    }
}
