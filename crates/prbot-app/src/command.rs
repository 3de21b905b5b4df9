//! Comment-body tokenizer.
//!
//! A command is a comment whose first non-blank text is the trigger, followed
//! by a verb and free-form arguments:
//!
//! ```text
//! /prbot ask <question>
//! /prbot explain [path[:start[-end]]] [question]
//! /prbot review [path]
//! /prbot help
//! ```

use prbot_core::LineRange;
use prbot_engine::{Command, FileTarget};

/// Parse `body` addressed with `trigger`. Returns `None` for comments that are
/// not commands (or name an unknown verb).
pub fn parse_command(body: &str, trigger: &str) -> Option<Command> {
    let rest = body.trim_start().strip_prefix(trigger)?;
    // "/prbotx" is not "/prbot"
    if rest.chars().next().is_some_and(|c| !c.is_whitespace()) {
        return None;
    }

    let rest = rest.trim();
    let (verb, args) = match rest.split_once(char::is_whitespace) {
        Some((verb, args)) => (verb, args.trim()),
        None => (rest, ""),
    };

    match verb.to_ascii_lowercase().as_str() {
        "" | "help" => Some(Command::Help),
        "ask" if args.is_empty() => Some(Command::Help),
        "ask" => Some(Command::Ask {
            question: args.to_string(),
        }),
        "explain" => {
            let (first, remainder) = first_token(args);
            match first.and_then(parse_target) {
                Some(target) => Some(Command::Explain {
                    target: Some(target),
                    question: non_empty(remainder),
                }),
                None => Some(Command::Explain {
                    target: None,
                    question: non_empty(args),
                }),
            }
        }
        "review" => Some(Command::Review {
            path: first_token(args).0.map(|p| p.trim_start_matches("./").to_string()),
        }),
        _ => None,
    }
}

fn first_token(args: &str) -> (Option<&str>, &str) {
    if args.is_empty() {
        return (None, "");
    }
    match args.split_once(char::is_whitespace) {
        Some((first, rest)) => (Some(first), rest.trim()),
        None => (Some(args), ""),
    }
}

fn non_empty(s: &str) -> Option<String> {
    let s = s.trim();
    (!s.is_empty()).then(|| s.to_string())
}

/// `path`, `path:12` or `path:12-20`. Bare words without a `.` or `/` are not
/// paths, so `explain why is this slow` stays a question.
pub fn parse_target(token: &str) -> Option<FileTarget> {
    let token = token.trim_matches('`');
    let (path, range) = match token.rsplit_once(':') {
        Some((path, lines)) => match parse_range(lines) {
            Some(range) => (path, Some(range)),
            None => (token, None),
        },
        None => (token, None),
    };

    let path = path.trim_start_matches("./");
    if path.is_empty() || !(path.contains('.') || path.contains('/')) {
        return None;
    }
    Some(FileTarget {
        path: path.to_string(),
        range,
    })
}

fn parse_range(lines: &str) -> Option<LineRange> {
    let lines = lines.trim_start_matches(['L', 'l']);
    match lines.split_once('-') {
        Some((start, end)) => {
            let start = start.parse().ok()?;
            let end = end.trim_start_matches(['L', 'l']).parse().ok()?;
            Some(LineRange::new(start, end))
        }
        None => lines.parse().ok().map(LineRange::single),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: &str = "/prbot";

    #[test]
    fn test_non_commands_are_ignored() {
        assert_eq!(parse_command("looks good to me", T), None);
        assert_eq!(parse_command("/prbotx ask hi", T), None);
        assert_eq!(parse_command("please /prbot ask hi", T), None);
        assert_eq!(parse_command("/prbot dance", T), None);
    }

    #[test]
    fn test_bare_trigger_and_help() {
        assert_eq!(parse_command("/prbot", T), Some(Command::Help));
        assert_eq!(parse_command("  /prbot  \n", T), Some(Command::Help));
        assert_eq!(parse_command("/prbot HELP", T), Some(Command::Help));
        assert_eq!(parse_command("/prbot ask", T), Some(Command::Help));
    }

    #[test]
    fn test_ask_keeps_multiline_question() {
        assert_eq!(
            parse_command("/prbot ask why is\nthis retrying?", T),
            Some(Command::Ask {
                question: "why is\nthis retrying?".to_string()
            })
        );
    }

    #[test]
    fn test_explain_variants() {
        assert_eq!(
            parse_command("/prbot explain src/lib.rs:10-20 is this safe?", T),
            Some(Command::Explain {
                target: Some(FileTarget {
                    path: "src/lib.rs".to_string(),
                    range: Some(LineRange::new(10, 20)),
                }),
                question: Some("is this safe?".to_string()),
            })
        );
        assert_eq!(
            parse_command("/prbot explain ./README.md", T),
            Some(Command::Explain {
                target: Some(FileTarget {
                    path: "README.md".to_string(),
                    range: None,
                }),
                question: None,
            })
        );
        assert_eq!(
            parse_command("/prbot explain why does this loop", T),
            Some(Command::Explain {
                target: None,
                question: Some("why does this loop".to_string()),
            })
        );
        assert_eq!(
            parse_command("/prbot explain", T),
            Some(Command::Explain {
                target: None,
                question: None,
            })
        );
    }

    #[test]
    fn test_target_forms() {
        let t = parse_target("`src/a.rs:L7-L9`").unwrap();
        assert_eq!(t.path, "src/a.rs");
        assert_eq!(t.range, Some(LineRange::new(7, 9)));

        let t = parse_target("Makefile.toml:3").unwrap();
        assert_eq!(t.range, Some(LineRange::single(3)));

        // not a line range, so the colon stays in the path
        let t = parse_target("docs/a:b.md").unwrap();
        assert_eq!(t.path, "docs/a:b.md");
        assert_eq!(t.range, None);

        assert_eq!(parse_target("why"), None);
        assert_eq!(parse_target(":12"), None);
    }

    #[test]
    fn test_review_path() {
        assert_eq!(
            parse_command("/prbot review", T),
            Some(Command::Review { path: None })
        );
        assert_eq!(
            parse_command("/prbot review ./src/main.rs please", T),
            Some(Command::Review {
                path: Some("src/main.rs".to_string())
            })
        );
    }

    #[test]
    fn test_custom_trigger() {
        assert_eq!(parse_command("@bot help", "@bot"), Some(Command::Help));
        assert_eq!(parse_command("/prbot help", "@bot"), None);
    }
}
