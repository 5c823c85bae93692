use std::path::PathBuf;
use std::process::ExitCode;

use clap::error::ErrorKind;
use clap::Parser;

/// Just an engine for classical 2D RTS games.
#[derive(Parser, Debug)]
#[command(name = "warkeep", about = "Just an engine for classical 2D RTS games.")]
struct Cli {
    /// Path to game data
    #[arg(short, long)]
    data: Option<PathBuf>,
}

fn main() -> ExitCode {
    env_logger::init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(err) => {
            let _ = err.print();
            return match err.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => ExitCode::FAILURE,
            };
        }
    };

    if let Some(data) = cli.data {
        log::info!("Using given data path: {:?}", data);
    }
    ExitCode::SUCCESS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_path_is_accepted_short_and_long() {
        let cli = Cli::try_parse_from(["warkeep", "-d", "/game/data"]).unwrap();
        assert_eq!(cli.data, Some(PathBuf::from("/game/data")));

        let cli = Cli::try_parse_from(["warkeep", "--data", "/game/data"]).unwrap();
        assert_eq!(cli.data, Some(PathBuf::from("/game/data")));

        let cli = Cli::try_parse_from(["warkeep"]).unwrap();
        assert_eq!(cli.data, None);
    }

    #[test]
    fn help_is_reported_as_a_display_request() {
        let err = Cli::try_parse_from(["warkeep", "--help"]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DisplayHelp);
    }

    #[test]
    fn unknown_options_are_rejected() {
        let err = Cli::try_parse_from(["warkeep", "--frobnicate"]).unwrap_err();
        assert_ne!(err.kind(), ErrorKind::DisplayHelp);
        assert_ne!(err.kind(), ErrorKind::DisplayVersion);
    }
}
