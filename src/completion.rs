//! # Shell Completion Module
//!
//! Static completion scripts come from `clap_complete`. Bash and fish also
//! get a small hook that completes `search` and `suggest` queries from the
//! user's history via the hidden `complete-queries` command.
//!
//! ## Usage
//!
//! ```bash
//! tunesift completion bash > ~/.local/share/bash-completion/completions/tunesift
//! tunesift completion fish > ~/.config/fish/completions/tunesift.fish
//! ```

use clap::Command;
use clap_complete::{generate, Generator, Shell as CompletionShell};
use std::io::{self, Write};

use crate::cli::Shell;

const BASH_QUERY_HOOK: &str = r#"
# Query completion from search history
_tunesift_queries() {
    local cur="${COMP_WORDS[COMP_CWORD]}"
    case "${COMP_WORDS[1]}" in
        search|suggest)
            if [[ $COMP_CWORD -eq 2 ]]; then
                mapfile -t COMPREPLY < <(tunesift complete-queries "$cur" 2>/dev/null)
                return 0
            fi
            ;;
    esac
    _tunesift "$@"
}
complete -F _tunesift_queries -o bashdefault -o default tunesift
"#;

const FISH_QUERY_HOOK: &str = r#"
# Query completion from search history
complete -c tunesift -f -n '__fish_seen_subcommand_from search suggest' -a '(tunesift complete-queries (commandline -ct) 2>/dev/null)'
"#;

/// Generate shell completions for the given shell
pub fn generate_completions<G: Generator>(gen: G, cmd: &mut Command, out: &mut dyn Write) {
    generate(gen, cmd, cmd.get_name().to_string(), out);
}

/// Full completion script for `shell`, dynamic query hook included where
/// the shell supports it
pub fn write_completion_script(shell: Shell, cmd: &mut Command, out: &mut dyn Write) -> io::Result<()> {
    generate_completions(shell_to_completion_shell(shell), cmd, out);
    match shell {
        Shell::Bash => out.write_all(BASH_QUERY_HOOK.as_bytes()),
        Shell::Fish => out.write_all(FISH_QUERY_HOOK.as_bytes()),
        Shell::Zsh | Shell::PowerShell | Shell::Elvish => Ok(()),
    }
}

/// Convert our Shell enum to clap_complete's Shell enum
#[must_use]
pub const fn shell_to_completion_shell(shell: Shell) -> CompletionShell {
    match shell {
        Shell::Bash => CompletionShell::Bash,
        Shell::Zsh => CompletionShell::Zsh,
        Shell::Fish => CompletionShell::Fish,
        Shell::PowerShell => CompletionShell::PowerShell,
        Shell::Elvish => CompletionShell::Elvish,
    }
}

/// One completion per line. Shell scripts read these with `mapfile`, so
/// embedded newlines and tabs are flattened to spaces.
pub fn print_query_completions(queries: &[String], out: &mut dyn Write) -> io::Result<()> {
    for query in queries {
        let line: String = query
            .chars()
            .map(|c| if c == '\n' || c == '\t' { ' ' } else { c })
            .collect();
        writeln!(out, "{line}")?;
    }
    Ok(())
}
