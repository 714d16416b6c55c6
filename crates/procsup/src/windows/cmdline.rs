//! Windows command-line quoting
//!
//! `CreateProcessW` takes one string; the child's C runtime splits it back
//! into arguments. [`quote_arg`] produces text that splits back to exactly
//! the original argument under the runtime's backslash and quote rules.

const QUOTE: u16 = b'"' as u16;
const BACKSLASH: u16 = b'\\' as u16;
const SPACE: u16 = b' ' as u16;
const TAB: u16 = b'\t' as u16;

fn needs_quotes(arg: &[u16]) -> bool {
    arg.is_empty() || arg.iter().any(|&c| c == SPACE || c == TAB || c == QUOTE)
}

fn push_backslashes(out: &mut Vec<u16>, count: usize) {
    out.extend(std::iter::repeat_n(BACKSLASH, count));
}

/// Append `arg` to `out`, quoted when it is empty or contains whitespace
/// or a double quote
pub fn quote_arg(arg: &[u16], out: &mut Vec<u16>) {
    if !needs_quotes(arg) {
        out.extend_from_slice(arg);
        return;
    }

    out.push(QUOTE);
    let mut backslashes = 0;
    for &c in arg {
        if c == BACKSLASH {
            backslashes += 1;
            continue;
        }
        if c == QUOTE {
            // Backslashes before a quote are doubled and the quote escaped
            push_backslashes(out, backslashes * 2 + 1);
        } else {
            push_backslashes(out, backslashes);
        }
        out.push(c);
        backslashes = 0;
    }
    // Trailing backslashes precede the closing quote
    push_backslashes(out, backslashes * 2);
    out.push(QUOTE);
}

/// Join arguments into one command line
pub fn join_wide<'a, I>(args: I) -> Vec<u16>
where
    I: IntoIterator<Item = &'a [u16]>,
{
    let mut line = Vec::new();
    for (index, arg) in args.into_iter().enumerate() {
        if index > 0 {
            line.push(SPACE);
        }
        quote_arg(arg, &mut line);
    }
    line
}

/// UTF-8 convenience over [`join_wide`]
pub fn join_args<I, S>(args: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let wide: Vec<Vec<u16>> = args
        .into_iter()
        .map(|arg| arg.as_ref().encode_utf16().collect())
        .collect();
    String::from_utf16_lossy(&join_wide(wide.iter().map(Vec::as_slice)))
}

/// Split a command line the way the C runtime does for arguments after
/// the program name
pub fn split_command_line(line: &[u16]) -> Vec<Vec<u16>> {
    let mut args = Vec::new();
    let mut i = 0;
    loop {
        while i < line.len() && (line[i] == SPACE || line[i] == TAB) {
            i += 1;
        }
        if i >= line.len() {
            return args;
        }

        let mut current = Vec::new();
        let mut quoted = false;
        while i < line.len() {
            let c = line[i];
            if (c == SPACE || c == TAB) && !quoted {
                break;
            }
            if c == BACKSLASH {
                let run = line[i..].iter().take_while(|&&c| c == BACKSLASH).count();
                if line.get(i + run) == Some(&QUOTE) {
                    push_backslashes(&mut current, run / 2);
                    if run % 2 == 1 {
                        current.push(QUOTE);
                        i += run + 1;
                    } else {
                        i += run;
                    }
                } else {
                    push_backslashes(&mut current, run);
                    i += run;
                }
                continue;
            }
            if c == QUOTE {
                quoted = !quoted;
            } else {
                current.push(c);
            }
            i += 1;
        }
        args.push(current);
    }
}

/// UTF-8 convenience over [`split_command_line`]
pub fn split_args(line: &str) -> Vec<String> {
    let wide: Vec<u16> = line.encode_utf16().collect();
    split_command_line(&wide)
        .iter()
        .map(|arg| String::from_utf16_lossy(arg))
        .collect()
}
