use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use reedline::{DefaultPrompt, DefaultPromptSegment, Prompt, Reedline};
use tokio::sync::{mpsc, Mutex};

use crate::dispatch::Feeder;
use crate::plot::Plotter;
use crate::state::DeviceState;
use crate::transport::{MockTransport, SerialTransport, Transport};

mod dispatch;
mod plot;
mod plotfile;
mod settings;
mod state;
mod svg;
mod transport;

const TICK: Duration = Duration::from_millis(50);

#[derive(Parser)]
struct Args {
    /// An SVG or JSON plot file. Starts interactive mode when omitted.
    path: Option<PathBuf>,

    /// Serial port of the EiBotBoard. Auto-detected when omitted.
    #[arg(long)]
    port: Option<String>,

    /// Run against a simulated board instead of real hardware.
    #[arg(long)]
    simulate: bool,

    /// Keep the pen down while traveling between paths.
    #[arg(long)]
    no_lift: bool,

    /// Where pen and speed settings are kept.
    #[arg(long, default_value = "ebb-feeder.json")]
    settings: PathBuf,

    /// Plot area width in mm.
    #[arg(long, default_value_t = 300.0)]
    width: f64,

    /// Plot area height in mm.
    #[arg(long, default_value_t = 218.0)]
    height: f64,
}

#[derive(Debug)]
enum Error {
    Exit,
    Err(anyhow::Error),
}

impl<E> From<E> for Error
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Error::Err(e.into())
    }
}

type Result<T> = std::result::Result<T, Error>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    pretty_env_logger::init();
    let args = Args::parse();

    let stored = settings::load(&args.settings)?;
    let state = Arc::new(Mutex::new(DeviceState::new(&stored)));
    let (incoming_tx, incoming_rx) = mpsc::channel(128);

    let res = if args.simulate {
        eprintln!("simulating a plotter; nothing will move");
        let transport = MockTransport::auto_acking(incoming_tx);
        run_session(transport, incoming_rx, state.clone(), &args).await
    } else {
        let port = match &args.port {
            Some(port) => port.clone(),
            None => {
                let bar = ProgressBar::new_spinner().with_message("Searching...");
                bar.enable_steady_tick(TICK);
                let port = transport::find_plotter_port()?;
                bar.finish_with_message(format!("found {port}"));
                port
            }
        };
        let transport = SerialTransport::open(&port, incoming_tx)?;
        run_session(transport, incoming_rx, state.clone(), &args).await
    };

    settings::save(&args.settings, &state.lock().await.stored_settings())?;

    match res {
        Ok(()) | Err(Error::Exit) => {
            eprintln!("exiting...");
            Ok(())
        }
        Err(Error::Err(e)) => Err(e),
    }
}

async fn run_session<T: Transport>(
    transport: T,
    incoming: mpsc::Receiver<Vec<u8>>,
    state: Arc<Mutex<DeviceState>>,
    args: &Args,
) -> Result<()> {
    let (ops_tx, ops_rx) = mpsc::channel(16);
    let feeder = Feeder::new(transport, state.clone());
    let task = tokio::spawn(feeder.run(incoming, ops_rx));
    let plotter = Plotter::new(ops_tx, state);

    let bar = ProgressBar::new_spinner().with_message("Configuring...");
    bar.enable_steady_tick(TICK);
    plotter.configure().await?;
    bar.finish_with_message("ready");

    let res = if let Some(path) = &args.path {
        plot_file(&plotter, path, args).await
    } else {
        command_mode(&plotter, args).await
    };

    plotter.shutdown().await;
    task.abort();
    res
}

async fn plot_file(plotter: &Plotter, path: &Path, args: &Args) -> Result<()> {
    // JSON plot files carry their own placement; SVGs get fitted to the
    // page.
    let paths = if path.extension().is_some_and(|e| e == "json") {
        plotfile::load_plot(path)?
    } else {
        let mut bez = svg::load_svg(path)?;
        svg::fit_to_page(&mut bez, args.width, args.height);
        svg::polylines(&bez, svg::FLATTEN_TOLERANCE)
    };
    eprintln!("plotting {} paths from {}", paths.len(), path.display());

    plotter.plot_paths(paths, !args.no_lift).await?;
    watch_progress(plotter).await?;
    Ok(())
}

/// Follow a running plot with a progress bar until the dispatch task
/// declares it finished.
async fn watch_progress(plotter: &Plotter) -> Result<()> {
    let style = ProgressStyle::with_template("{wide_bar} {percent}% ({elapsed})")?;
    let bar = ProgressBar::new(1000).with_style(style);
    loop {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let snap = plotter.snapshot().await;
        if snap.dist_total > 0.0 {
            bar.set_position((snap.dist_done / snap.dist_total * 1000.0) as u64);
        }
        if !snap.plotting && snap.queued == 0 {
            break;
        }
    }
    bar.finish();
    Ok(())
}

fn string_prompt(s: &str) -> DefaultPrompt {
    DefaultPrompt::new(
        DefaultPromptSegment::Basic(s.to_owned()),
        DefaultPromptSegment::Basic(s.to_owned()),
    )
}

fn read_cmd(reed: &mut Reedline, prompt: &dyn Prompt) -> Result<String> {
    let s = reed.read_line(prompt)?;
    match s {
        reedline::Signal::Success(s) => Ok(s),
        reedline::Signal::CtrlC | reedline::Signal::CtrlD => Err(Error::Exit),
    }
}

fn read_number(reed: &mut Reedline, prompt: &str) -> Result<Option<f64>> {
    let s = read_cmd(reed, &string_prompt(prompt))?;
    match s.trim().parse::<f64>() {
        Ok(x) => Ok(Some(x)),
        Err(_) => {
            eprintln!("error: expected a number");
            Ok(None)
        }
    }
}

async fn command_mode(plotter: &Plotter, args: &Args) -> Result<()> {
    let mut reed = Reedline::create();
    let prompt = DefaultPrompt::default();
    loop {
        let s = read_cmd(&mut reed, &prompt)?;
        let s = s.trim();
        let (cmd, rest) = s.split_once(' ').unwrap_or((s, ""));

        match cmd {
            "quit" => break,
            "plot" => {
                if rest.is_empty() {
                    eprintln!("usage: plot <file.svg>");
                    continue;
                }
                if let Err(Error::Err(e)) = plot_file(plotter, Path::new(rest), args).await {
                    eprintln!("plot failed: {e}");
                }
            }
            "move" => {
                let Some(x) = read_number(&mut reed, "x? ")? else {
                    continue;
                };
                let Some(y) = read_number(&mut reed, "y? ")? else {
                    continue;
                };
                plotter.move_to(x, y).await?;
            }
            "up" => plotter.pen_up().await?,
            "down" => plotter.pen_down().await?,
            "pause" => plotter.pause().await?,
            "resume" => plotter.resume().await?,
            "stop" => plotter.stop().await?,
            "origin" => plotter.set_origin().await?,
            "disengage" => plotter.disengage().await?,
            "query" => {
                let pos = plotter.get_position().await?;
                eprintln!("board reports ({:.2}, {:.2})", pos.x, pos.y);
            }
            "reset" => {
                plotter.reset().await?;
                plotter.configure().await?;
            }
            "where" => {
                let snap = plotter.snapshot().await;
                eprintln!(
                    "position ({:.2}, {:.2}) board ({:.2}, {:.2}) pen {}  \
                     queued {}  in flight {} ({} sent / {} done)",
                    snap.position.x,
                    snap.position.y,
                    snap.reported_position.x,
                    snap.reported_position.y,
                    if snap.position.pen_up { "up" } else { "down" },
                    snap.queued,
                    snap.pending,
                    snap.sent,
                    snap.completed,
                );
            }
            "speed" => {
                if let Some(pct) = parse_number(&mut reed, rest, "percent? ")? {
                    plotter.set_speed_pct(pct).await;
                }
            }
            "travel-speed" => {
                if let Some(pct) = parse_number(&mut reed, rest, "percent? ")? {
                    plotter.set_travel_speed_pct(pct).await;
                }
            }
            "pen-up" => {
                if let Some(value) = parse_number(&mut reed, rest, "servo units? ")? {
                    plotter.set_pen_up_value(value as u32).await?;
                }
            }
            "pen-down" => {
                if let Some(value) = parse_number(&mut reed, rest, "servo units? ")? {
                    plotter.set_pen_down_value(value as u32).await?;
                }
            }
            "help" | "?" => {
                eprintln!(
                    "commands: plot <file>, move, up, down, pause, resume, stop, origin,\n\
                     query, disengage, reset, where, speed <pct>, travel-speed <pct>,\n\
                     pen-up <servo units>, pen-down <servo units>, quit"
                );
            }
            "" => {}
            other => eprintln!("unknown command {other:?}; try \"help\""),
        }
    }

    Ok(())
}

fn parse_number(reed: &mut Reedline, rest: &str, prompt: &str) -> Result<Option<f64>> {
    if rest.is_empty() {
        read_number(reed, prompt)
    } else {
        match rest.trim().parse::<f64>() {
            Ok(x) => Ok(Some(x)),
            Err(_) => {
                eprintln!("error: expected a number");
                Ok(None)
            }
        }
    }
}
