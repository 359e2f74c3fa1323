//! pargz - parallel gzip compression and decompression.
//!
//! A drop-in gzip-style CLI that compresses blocks on all processors and
//! reassembles them in order. Inspired by [pigz](https://zlib.net/pigz/)
//! by Mark Adler.

use std::env;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use pargz::{
    cli::PargzArgs,
    compress::{compress_file, Framing, GzOptions, DEFAULT_BLOCK_SIZE},
    decompress,
    error::{PargzError, PargzResult},
    header,
};

const VERSION: &str = concat!("pargz ", env!("CARGO_PKG_VERSION"));

/// Track the current output file so signal handlers can clean it up.
/// When set, an incomplete output file exists that should be deleted on abort.
static OUTPUT_FILE: Mutex<Option<String>> = Mutex::new(None);
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

fn set_output_file(path: Option<String>) {
    if let Ok(mut guard) = OUTPUT_FILE.lock() {
        *guard = path;
    }
}

#[cfg(unix)]
fn install_signal_handlers() {
    unsafe {
        // SIGINT (Ctrl-C), SIGTERM, SIGHUP: clean up and exit
        for &sig in &[libc::SIGINT, libc::SIGTERM, libc::SIGHUP] {
            libc::signal(sig, signal_handler as *const () as libc::sighandler_t);
        }
        // SIGPIPE: exit quietly (e.g., piping to head)
        libc::signal(libc::SIGPIPE, libc::SIG_DFL);
    }
}

#[cfg(not(unix))]
fn install_signal_handlers() {}

#[cfg(unix)]
extern "C" fn signal_handler(sig: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);

    // try_lock only: a signal can land while the main thread holds the lock.
    if let Ok(guard) = OUTPUT_FILE.try_lock() {
        if let Some(ref path) = *guard {
            let _ = std::fs::remove_file(path);
        }
    }

    unsafe {
        libc::signal(sig, libc::SIG_DFL);
        libc::raise(sig);
    }
}

fn main() {
    install_signal_handlers();

    match run() {
        Ok(exit_code) => process::exit(exit_code),
        Err(e) => {
            eprintln!("pargz: {}", e);
            process::exit(1);
        }
    }
}

fn run() -> PargzResult<i32> {
    let args = PargzArgs::parse()?;

    if args.version {
        println!("{}", VERSION);
        return Ok(0);
    }

    if args.help {
        print_help();
        return Ok(0);
    }

    // Support unpargz/gunzip/zcat symlinks
    let program_path = env::args().next().unwrap_or_else(|| "pargz".to_string());
    let program_name = Path::new(&program_path)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("pargz");

    let mut args = args;
    if program_name.contains("unpargz") || program_name.contains("gunzip") {
        args.decompress = true;
    }
    if program_name == "zcat" || program_name == "gzcat" {
        args.decompress = true;
        args.stdout = true;
    }
    // -t implies decompress mode
    if args.test {
        args.decompress = true;
    }

    // Refuse to write compressed binary data to a terminal (unless -f)
    if !args.decompress && (args.stdout || args.files.is_empty()) && !args.force {
        use std::io::IsTerminal;
        if std::io::stdout().is_terminal() {
            eprintln!("pargz: compressed data not written to a terminal. Use -f to force.");
            return Ok(1);
        }
    }

    let mut exit_code = 0;

    if args.list {
        if args.files.is_empty() {
            eprintln!("pargz: --list does not support stdin");
            return Ok(1);
        }
        println!("  compressed  uncompressed  ratio  uncompressed_name");
        let mut total_comp = 0u64;
        let mut total_uncomp = 0u64;
        for file in &args.files {
            match list_file(Path::new(file), &args) {
                Ok((comp, uncomp)) => {
                    total_comp += comp;
                    total_uncomp += uncomp;
                }
                Err(e) => {
                    eprintln!("pargz: {}: {}", file, e);
                    exit_code = 1;
                }
            }
        }
        if args.files.len() > 1 {
            let ratio = if total_uncomp > 0 {
                (1.0 - total_comp as f64 / total_uncomp as f64) * 100.0
            } else {
                0.0
            };
            println!(
                "{:>12}  {:>12}  {:4.1}%  (totals)",
                total_comp, total_uncomp, ratio
            );
        }
        return Ok(exit_code);
    }

    if args.files.is_empty() || args.files.iter().all(|f| f == "-") {
        exit_code = process_stdin(&args)?;
    } else {
        let paths = expand_paths(&args)?;
        for path in &paths {
            let result = if args.test {
                test_file(path, &args)
            } else if args.decompress {
                decompress_one(path, &args)
            } else {
                compress_one(path, &args)
            };

            match result {
                Ok(code) => {
                    if code != 0 {
                        exit_code = code;
                    }
                }
                Err(e) => {
                    eprintln!("pargz: {}: {}", path.display(), e);
                    exit_code = 1;
                }
            }
        }
    }

    Ok(exit_code)
}

fn build_opts(args: &PargzArgs, source: Option<&Path>) -> GzOptions {
    let mut opts = GzOptions {
        level: args.level,
        block_size: args.block_size.unwrap_or(DEFAULT_BLOCK_SIZE),
        threads: effective_threads(args),
        framing: if args.independent {
            Framing::IndependentMembers
        } else {
            Framing::SingleMember
        },
        header: Default::default(),
    };
    opts.header.comment = args.comment.clone();
    if args.save_name && !args.no_name {
        if let Some(path) = source {
            opts.header.filename = path
                .file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.to_string());
            if let Ok(meta) = path.metadata() {
                if let Ok(mtime) = meta.modified() {
                    if let Ok(secs) = mtime.duration_since(std::time::UNIX_EPOCH) {
                        opts.header.mtime = secs.as_secs() as u32;
                    }
                }
            }
        }
    }
    opts
}

fn effective_threads(args: &PargzArgs) -> usize {
    args.threads
        .unwrap_or_else(|| std::thread::available_parallelism().map_or(1, |n| n.get()))
}

/// Resolve the file arguments, recursing into directories with -r.
fn expand_paths(args: &PargzArgs) -> PargzResult<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for file in &args.files {
        let path = PathBuf::from(file);
        if path.is_dir() {
            if !args.recursive {
                eprintln!("pargz: {}: is a directory -- ignored (use -r)", file);
                continue;
            }
            for entry in walkdir::WalkDir::new(&path).follow_links(false) {
                let entry = entry?;
                if entry.file_type().is_file() {
                    paths.push(entry.path().to_path_buf());
                }
            }
        } else if path.exists() {
            paths.push(path);
        } else {
            return Err(PargzError::FileNotFound(file.clone()));
        }
    }
    Ok(paths)
}

fn process_stdin(args: &PargzArgs) -> PargzResult<i32> {
    let mut input = Vec::new();
    std::io::stdin().lock().read_to_end(&mut input)?;

    if args.test {
        let mut sink = std::io::sink();
        match decompress::decompress_buffer(&input, &mut sink, effective_threads(args)) {
            Ok(_) => {
                if !args.quiet {
                    eprintln!("stdin: OK");
                }
                Ok(0)
            }
            Err(e) => {
                eprintln!("stdin: {}", e);
                Ok(1)
            }
        }
    } else if args.decompress {
        let stdout = std::io::stdout();
        let mut out = BufWriter::new(stdout.lock());
        decompress::decompress_buffer(&input, &mut out, effective_threads(args))?;
        out.flush()?;
        Ok(0)
    } else {
        let opts = build_opts(args, None);
        let stdout = std::io::stdout();
        let out = BufWriter::new(stdout.lock());
        let mut gz = pargz::ParallelGzWriter::new(out, opts)?;
        gz.write_all(&input)?;
        gz.finish()?.flush()?;
        Ok(0)
    }
}

fn compress_one(path: &Path, args: &PargzArgs) -> PargzResult<i32> {
    let name = path.to_string_lossy().into_owned();
    if name.ends_with(&args.suffix) && !args.force {
        if !args.quiet {
            eprintln!(
                "pargz: {}: already has {} suffix -- skipped",
                name, args.suffix
            );
        }
        return Ok(2);
    }

    let opts = build_opts(args, Some(path));

    if args.stdout {
        let stdout = std::io::stdout();
        let mut out = BufWriter::new(stdout.lock());
        compress_file(path, &mut out, &opts)?;
        out.flush()?;
        return Ok(0);
    }

    let output = PathBuf::from(format!("{}{}", name, args.suffix));
    check_overwrite(&output, args)?;

    set_output_file(Some(output.to_string_lossy().into_owned()));
    let result = File::create(&output)
        .map_err(PargzError::Io)
        .and_then(|f| compress_file(path, BufWriter::new(f), &opts));
    match result {
        Ok(uncompressed) => {
            set_output_file(None);
            copy_file_times(path, &output);
            if args.verbose && !args.quiet {
                report_ratio(&name, &output, uncompressed);
            }
            if !args.keep {
                fs::remove_file(path)?;
            }
            Ok(0)
        }
        Err(e) => {
            // Never leave a partial output behind.
            let _ = fs::remove_file(&output);
            set_output_file(None);
            Err(e)
        }
    }
}

fn decompress_one(path: &Path, args: &PargzArgs) -> PargzResult<i32> {
    let threads = effective_threads(args);

    if args.stdout {
        let stdout = std::io::stdout();
        let mut out = BufWriter::new(stdout.lock());
        decompress::decompress_file(path, &mut out, threads)?;
        out.flush()?;
        return Ok(0);
    }

    let output = decompressed_name(path, args)?;
    check_overwrite(&output, args)?;

    set_output_file(Some(output.to_string_lossy().into_owned()));
    let result = (|| -> PargzResult<u64> {
        let mut out = BufWriter::new(File::create(&output)?);
        let n = decompress::decompress_file(path, &mut out, threads)?;
        out.flush()?;
        Ok(n)
    })();
    match result {
        Ok(_) => {
            set_output_file(None);
            copy_file_times(path, &output);
            if !args.keep {
                fs::remove_file(path)?;
            }
            Ok(0)
        }
        Err(e) => {
            let _ = fs::remove_file(&output);
            set_output_file(None);
            Err(e)
        }
    }
}

/// Output name for decompression: the stored FNAME when -N asked for it,
/// otherwise the input name with its suffix stripped.
fn decompressed_name(path: &Path, args: &PargzArgs) -> PargzResult<PathBuf> {
    if args.save_name && !args.no_name {
        if let Some(stored) = stored_filename(path)? {
            // FNAME is a basename; never let it escape the input's directory.
            if let Some(base) = Path::new(&stored).file_name() {
                return Ok(path.with_file_name(base));
            }
        }
    }

    let name = path.to_string_lossy();
    if let Some(stripped) = name.strip_suffix(&args.suffix) {
        if !stripped.is_empty() {
            return Ok(PathBuf::from(stripped));
        }
    }
    Err(PargzError::invalid_argument(format!(
        "{}: unknown suffix (expected {}); use -S",
        name, args.suffix
    )))
}

fn stored_filename(path: &Path) -> PargzResult<Option<String>> {
    let mut head = [0u8; 1024];
    let mut file = File::open(path)?;
    let mut filled = 0;
    while filled < head.len() {
        let n = file.read(&mut head[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    match header::parse_header(&head[..filled]) {
        Ok(parsed) => Ok(parsed.info.filename),
        // A name longer than the probe window is not worth a second read.
        Err(_) => Ok(None),
    }
}

fn check_overwrite(output: &Path, args: &PargzArgs) -> PargzResult<()> {
    if output.exists() && !args.force {
        return Err(PargzError::invalid_argument(format!(
            "{} already exists; use -f to overwrite",
            output.display()
        )));
    }
    Ok(())
}

/// Carry the source's timestamps and permissions onto the output, gzip-style.
fn copy_file_times(source: &Path, output: &Path) {
    if let Ok(meta) = source.metadata() {
        let mtime = filetime::FileTime::from_last_modification_time(&meta);
        let atime = filetime::FileTime::from_last_access_time(&meta);
        let _ = filetime::set_file_times(output, atime, mtime);
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(
                output,
                fs::Permissions::from_mode(meta.permissions().mode()),
            );
        }
    }
}

fn report_ratio(input: &str, output: &Path, uncompressed: u64) {
    if let Ok(meta) = output.metadata() {
        let compressed = meta.len();
        let ratio = if uncompressed > 0 {
            (1.0 - compressed as f64 / uncompressed as f64) * 100.0
        } else {
            0.0
        };
        eprintln!(
            "{}: {:.1}% -- replaced with {}",
            input,
            ratio,
            output.display()
        );
    }
}

/// Print compressed/uncompressed sizes for one file, gzip -l style.
/// ISIZE comes straight from the trailer, so multi-member files report
/// only their final member's payload, matching gzip.
fn list_file(path: &Path, args: &PargzArgs) -> PargzResult<(u64, u64)> {
    let metadata = path
        .metadata()
        .map_err(|_| PargzError::FileNotFound(path.to_string_lossy().into_owned()))?;
    let compressed = metadata.len();
    if compressed < (header::FIXED_HEADER_LEN + header::TRAILER_LEN) as u64 {
        return Err(PargzError::truncated("too short to be a gzip file"));
    }

    let data = fs::read(path)?;
    header::parse_header(&data)?;
    let (_, isize) = header::read_trailer(&data)?;
    let uncompressed = isize as u64;

    let ratio = if uncompressed > 0 {
        (1.0 - compressed as f64 / uncompressed as f64) * 100.0
    } else {
        0.0
    };

    let display_name = match stored_filename(path)? {
        Some(name) => name,
        None => {
            let name = path.to_string_lossy();
            let stripped = name.strip_suffix(&args.suffix).unwrap_or(&name);
            Path::new(stripped)
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| stripped.to_string())
        }
    };

    println!(
        "{:>12}  {:>12}  {:4.1}%  {}",
        compressed, uncompressed, ratio, display_name
    );
    Ok((compressed, uncompressed))
}

/// Verify a compressed file decodes cleanly, discarding the payload.
fn test_file(path: &Path, args: &PargzArgs) -> PargzResult<i32> {
    let mut sink = std::io::sink();
    match decompress::decompress_file(path, &mut sink, effective_threads(args)) {
        Ok(_) => {
            if !args.quiet {
                eprintln!("{}: OK", path.display());
            }
            Ok(0)
        }
        Err(e) => {
            eprintln!("{}: {}", path.display(), e);
            Ok(1)
        }
    }
}

fn print_help() {
    println!("Usage: pargz [OPTION]... [FILE]...");
    println!();
    println!("Compress or decompress FILEs (by default, compress in place).");
    println!("Uses multiple processors for parallel compression.");
    println!();
    println!("Options:");
    println!("  -1..-9              Compression level (1=fast, 9=best, default=6)");
    println!("  -c, --stdout        Write to stdout, keep original files");
    println!("  -d, --decompress    Decompress");
    println!("  -f, --force         Force overwrite");
    println!("  -k, --keep          Keep original file");
    println!("  -t, --test          Test compressed file integrity");
    println!("  -l, --list          List compressed file info");
    println!("  -n, --no-name       Don't save/restore original name and timestamp");
    println!("  -N, --name          Save/restore original name and timestamp");
    println!("  -p, --processes N   Number of threads (default: all CPUs)");
    println!("  -b, --blocksize N   Block size in KiB for parallel compression");
    println!("  -i, --independent   Frame each block as its own gzip member");
    println!("  -r, --recursive     Recurse into directories");
    println!("  -S, --suffix .suf   Use suffix .suf instead of .gz");
    println!("  -C, --comment TEXT  Add comment to gzip header");
    println!("  -q, --quiet         Suppress output");
    println!("  -v, --verbose       Verbose output");
    println!("  -h, --help          Show this help");
    println!("  -V, --version       Show version");
    println!();
    println!("Examples:");
    println!("  pargz file.txt          Compress file.txt -> file.txt.gz");
    println!("  pargz -d file.txt.gz    Decompress file.txt.gz -> file.txt");
    println!("  pargz -p4 -9 file.txt   Compress with 4 threads, best compression");
    println!("  cat file | pargz > out  Compress stdin to stdout");
}
