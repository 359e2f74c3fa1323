//! Command-line argument parsing.
//!
//! Hand-rolled to keep gzip-style flag semantics exact: clustered short
//! flags (`-dcv`), digit levels (`-9`), and values either attached
//! (`-p8`, `-b128`) or separate (`-p 8`).

use std::env;

use crate::error::{PargzError, PargzResult};

#[derive(Debug, Clone)]
pub struct PargzArgs {
    pub level: u32,
    pub decompress: bool,
    pub stdout: bool,
    pub keep: bool,
    pub force: bool,
    pub quiet: bool,
    pub verbose: bool,
    pub test: bool,
    pub list: bool,
    pub recursive: bool,
    pub independent: bool,
    pub no_name: bool,
    pub save_name: bool,
    pub help: bool,
    pub version: bool,
    pub threads: Option<usize>,
    /// Block size in bytes. The flag takes KiB, pigz-style.
    pub block_size: Option<usize>,
    pub suffix: String,
    pub comment: Option<String>,
    pub files: Vec<String>,
}

impl Default for PargzArgs {
    fn default() -> Self {
        PargzArgs {
            level: 6,
            decompress: false,
            stdout: false,
            keep: false,
            force: false,
            quiet: false,
            verbose: false,
            test: false,
            list: false,
            recursive: false,
            independent: false,
            no_name: false,
            save_name: true,
            help: false,
            version: false,
            threads: None,
            block_size: None,
            suffix: ".gz".to_string(),
            comment: None,
            files: Vec::new(),
        }
    }
}

impl PargzArgs {
    pub fn parse() -> PargzResult<Self> {
        Self::parse_from(env::args().skip(1))
    }

    pub fn parse_from<I>(iter: I) -> PargzResult<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut args = PargzArgs::default();
        let mut iter = iter.into_iter();
        let mut no_more_flags = false;

        while let Some(arg) = iter.next() {
            if no_more_flags || !arg.starts_with('-') || arg == "-" {
                args.files.push(arg);
                continue;
            }

            if let Some(long) = arg.strip_prefix("--") {
                if long.is_empty() {
                    no_more_flags = true;
                    continue;
                }
                let (name, inline_value) = match long.split_once('=') {
                    Some((n, v)) => (n, Some(v.to_string())),
                    None => (long, None),
                };
                match name {
                    "decompress" | "uncompress" => args.decompress = true,
                    "stdout" | "to-stdout" => args.stdout = true,
                    "keep" => args.keep = true,
                    "force" => args.force = true,
                    "quiet" => args.quiet = true,
                    "verbose" => args.verbose = true,
                    "test" => args.test = true,
                    "list" => args.list = true,
                    "recursive" => args.recursive = true,
                    "independent" => args.independent = true,
                    "no-name" => {
                        args.no_name = true;
                        args.save_name = false;
                    }
                    "name" => {
                        args.no_name = false;
                        args.save_name = true;
                    }
                    "help" => args.help = true,
                    "version" => args.version = true,
                    "fast" => args.level = 1,
                    "best" => args.level = 9,
                    "processes" => {
                        let v = take_value(name, inline_value, &mut iter)?;
                        args.threads = Some(parse_count(name, &v)?);
                    }
                    "blocksize" => {
                        let v = take_value(name, inline_value, &mut iter)?;
                        args.block_size = Some(parse_count(name, &v)?.saturating_mul(1024));
                    }
                    "suffix" => {
                        args.suffix = take_value(name, inline_value, &mut iter)?;
                    }
                    "comment" => {
                        args.comment = Some(take_value(name, inline_value, &mut iter)?);
                    }
                    _ => {
                        return Err(PargzError::invalid_argument(format!(
                            "unknown option --{}",
                            name
                        )));
                    }
                }
                continue;
            }

            // Short flags, possibly clustered. -p, -b, -S, -C take a value:
            // the rest of the cluster if non-empty, otherwise the next arg.
            let mut chars = arg[1..].chars();
            while let Some(c) = chars.next() {
                match c {
                    '0'..='9' => {
                        args.level = c.to_digit(10).unwrap_or(6);
                    }
                    'd' => args.decompress = true,
                    'c' => args.stdout = true,
                    'k' => args.keep = true,
                    'f' => args.force = true,
                    'q' => args.quiet = true,
                    'v' => args.verbose = true,
                    't' => args.test = true,
                    'l' => args.list = true,
                    'r' => args.recursive = true,
                    'i' => args.independent = true,
                    'n' => {
                        args.no_name = true;
                        args.save_name = false;
                    }
                    'N' => {
                        args.no_name = false;
                        args.save_name = true;
                    }
                    'h' => args.help = true,
                    'V' => args.version = true,
                    'p' | 'b' | 'S' | 'C' => {
                        let rest: String = chars.collect();
                        let value = if rest.is_empty() {
                            iter.next().ok_or_else(|| {
                                PargzError::invalid_argument(format!(
                                    "option -{} requires a value",
                                    c
                                ))
                            })?
                        } else {
                            rest
                        };
                        match c {
                            'p' => args.threads = Some(parse_count("p", &value)?),
                            'b' => {
                                args.block_size =
                                    Some(parse_count("b", &value)?.saturating_mul(1024))
                            }
                            'S' => args.suffix = value,
                            'C' => args.comment = Some(value),
                            _ => unreachable!(),
                        }
                        break;
                    }
                    _ => {
                        return Err(PargzError::invalid_argument(format!(
                            "unknown option -{}",
                            c
                        )));
                    }
                }
            }
        }

        if args.level > 9 {
            return Err(PargzError::InvalidLevel(args.level));
        }
        if let Some(0) = args.threads {
            return Err(PargzError::invalid_argument("thread count must be nonzero"));
        }
        if let Some(0) = args.block_size {
            return Err(PargzError::invalid_argument("block size must be nonzero"));
        }
        if !args.suffix.starts_with('.') || args.suffix.len() < 2 {
            return Err(PargzError::invalid_argument(format!(
                "suffix must start with '.': {:?}",
                args.suffix
            )));
        }

        Ok(args)
    }
}

fn take_value<I>(name: &str, inline: Option<String>, iter: &mut I) -> PargzResult<String>
where
    I: Iterator<Item = String>,
{
    match inline {
        Some(v) => Ok(v),
        None => iter.next().ok_or_else(|| {
            PargzError::invalid_argument(format!("option --{} requires a value", name))
        }),
    }
}

fn parse_count(name: &str, value: &str) -> PargzResult<usize> {
    value.parse::<usize>().map_err(|_| {
        PargzError::invalid_argument(format!("invalid value for -{}: {:?}", name, value))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(argv: &[&str]) -> PargzResult<PargzArgs> {
        PargzArgs::parse_from(argv.iter().map(|s| s.to_string()))
    }

    #[test]
    fn defaults() {
        let args = parse(&[]).unwrap();
        assert_eq!(args.level, 6);
        assert!(!args.decompress);
        assert!(args.save_name);
        assert_eq!(args.suffix, ".gz");
        assert!(args.files.is_empty());
    }

    #[test]
    fn clustered_short_flags() {
        let args = parse(&["-dcv", "file.gz"]).unwrap();
        assert!(args.decompress);
        assert!(args.stdout);
        assert!(args.verbose);
        assert_eq!(args.files, vec!["file.gz"]);
    }

    #[test]
    fn digit_level() {
        assert_eq!(parse(&["-9"]).unwrap().level, 9);
        assert_eq!(parse(&["-1"]).unwrap().level, 1);
        assert_eq!(parse(&["-k9"]).unwrap().level, 9);
    }

    #[test]
    fn threads_attached_and_separate() {
        assert_eq!(parse(&["-p8"]).unwrap().threads, Some(8));
        assert_eq!(parse(&["-p", "8"]).unwrap().threads, Some(8));
        assert_eq!(parse(&["--processes", "4"]).unwrap().threads, Some(4));
        assert_eq!(parse(&["--processes=4"]).unwrap().threads, Some(4));
    }

    #[test]
    fn blocksize_is_kib() {
        assert_eq!(parse(&["-b128"]).unwrap().block_size, Some(128 * 1024));
        assert_eq!(parse(&["--blocksize=64"]).unwrap().block_size, Some(64 * 1024));
    }

    #[test]
    fn suffix_and_comment() {
        let args = parse(&["-S", ".gzp", "-C", "built nightly"]).unwrap();
        assert_eq!(args.suffix, ".gzp");
        assert_eq!(args.comment.as_deref(), Some("built nightly"));
    }

    #[test]
    fn list_flag() {
        assert!(parse(&["-l", "a.gz"]).unwrap().list);
        assert!(parse(&["--list", "a.gz"]).unwrap().list);
        assert!(!parse(&["a.gz"]).unwrap().list);
    }

    #[test]
    fn name_flags_toggle() {
        let args = parse(&["-n"]).unwrap();
        assert!(args.no_name);
        assert!(!args.save_name);
        let args = parse(&["-n", "-N"]).unwrap();
        assert!(args.save_name);
    }

    #[test]
    fn double_dash_ends_flags() {
        let args = parse(&["--", "-weird-name"]).unwrap();
        assert_eq!(args.files, vec!["-weird-name"]);
    }

    #[test]
    fn stdin_placeholder_is_a_file() {
        let args = parse(&["-"]).unwrap();
        assert_eq!(args.files, vec!["-"]);
    }

    #[test]
    fn rejects_bad_input() {
        assert!(parse(&["-x"]).is_err());
        assert!(parse(&["--nonsense"]).is_err());
        assert!(parse(&["-p", "zero?"]).is_err());
        assert!(parse(&["-p0"]).is_err());
        assert!(parse(&["-b0"]).is_err());
        assert!(parse(&["-S", "gz"]).is_err());
    }
}
