use crate::config::HISTOGRAM_BINS;
use crate::data::AssetSummary;
use crate::report::{terminal_histogram, HistogramBin};
use crate::simulation::SimulationOutcome;
use crossterm::event::{self, Event, KeyCode, KeyEventKind};
use std::io;

/// Dashboard state for one finished simulation run.
pub struct App {
    pub should_quit: bool,
    pub show_paths: bool,
    pub outcome: SimulationOutcome,
    pub assets: Vec<AssetSummary>,
    pub histogram: Vec<HistogramBin>,
}

impl App {
    pub fn new(outcome: SimulationOutcome, assets: Vec<AssetSummary>) -> Self {
        let histogram = terminal_histogram(&outcome.paths.terminal_values(), HISTOGRAM_BINS);
        Self {
            should_quit: false,
            show_paths: true,
            outcome,
            assets,
            histogram,
        }
    }

    pub fn handle_key(&mut self, code: KeyCode) {
        match code {
            KeyCode::Char('q') | KeyCode::Esc => self.should_quit = true,
            KeyCode::Char('p') => self.show_paths = !self.show_paths,
            _ => {}
        }
    }

    pub async fn run(&mut self, terminal: &mut crate::tui::Tui) -> io::Result<()> {
        while !self.should_quit {
            terminal.draw(|f| crate::ui::render(f, self))?;

            if event::poll(std::time::Duration::from_millis(16))? {
                if let Event::Key(key) = event::read()? {
                    if key.kind == KeyEventKind::Press {
                        self.handle_key(key.code);
                    }
                }
            }
        }
        Ok(())
    }
}
