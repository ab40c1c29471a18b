use crate::app::App;
use crate::config::DASHBOARD_SAMPLE_PATHS;
use crate::report::Recommendation;
use ratatui::{
    Frame,
    layout::{Constraint, Direction, Layout, Rect},
    style::{Color, Modifier, Style},
    symbols,
    text::{Line, Span},
    widgets::{Axis, BarChart, Block, Borders, Chart, Dataset, GraphType, Paragraph},
};

pub fn render(f: &mut Frame, app: &App) {
    let layout = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Length(3), Constraint::Min(0), Constraint::Length(3)])
        .split(f.area());

    render_header(f, app, layout[0]);

    let body = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(72), Constraint::Percentage(28)])
        .split(layout[1]);

    let left = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Percentage(65), Constraint::Percentage(35)])
        .split(body[0]);

    render_paths(f, app, left[0]);
    render_histogram(f, app, left[1]);
    render_details(f, app, body[1]);
    render_footer(f, layout[2]);
}

fn recommendation_color(rec: Recommendation) -> Color {
    match rec {
        Recommendation::Invest => Color::Green,
        Recommendation::DoNotInvest => Color::Red,
    }
}

fn render_header(f: &mut Frame, app: &App, area: Rect) {
    let report = &app.outcome.report;
    let spans = vec![
        Span::styled(" Portfolio MC ", Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD)),
        Span::raw(" | "),
        Span::styled(
            app.outcome.statistics.symbols().join(", "),
            Style::default().fg(Color::White).add_modifier(Modifier::BOLD),
        ),
        Span::raw(" | "),
        Span::styled(format!("seed {}", app.outcome.seed), Style::default().fg(Color::Gray)),
        Span::raw(" | "),
        Span::styled(
            report.recommendation.to_string().to_uppercase(),
            Style::default()
                .fg(recommendation_color(report.recommendation))
                .add_modifier(Modifier::BOLD),
        ),
    ];

    let header = Paragraph::new(Line::from(spans)).block(Block::default().borders(Borders::ALL));
    f.render_widget(header, area);
}

fn render_footer(f: &mut Frame, area: Rect) {
    let footer = Paragraph::new(Line::from(vec![
        Span::styled(" Controls: ", Style::default().fg(Color::Gray)),
        Span::styled("p: toggle paths | q/Esc: quit", Style::default().fg(Color::White)),
    ]))
    .block(Block::default().borders(Borders::ALL));

    f.render_widget(footer, area);
}

fn band_points(initial: f64, values: &[f64]) -> Vec<(f64, f64)> {
    std::iter::once((0.0, initial))
        .chain(values.iter().enumerate().map(|(d, v)| ((d + 1) as f64, *v)))
        .collect()
}

fn render_paths(f: &mut Frame, app: &App, area: Rect) {
    let report = &app.outcome.report;
    let initial = report.initial_investment;
    let bands = &report.bands;

    let lower = band_points(initial, &bands.lower);
    let median = band_points(initial, &bands.median);
    let upper = band_points(initial, &bands.upper);
    let baseline = vec![(0.0, initial), (report.horizon_days as f64, initial)];

    let samples: Vec<Vec<(f64, f64)>> = if app.show_paths {
        app.outcome
            .paths
            .paths()
            .take(DASHBOARD_SAMPLE_PATHS)
            .map(|p| band_points(initial, p))
            .collect()
    } else {
        Vec::new()
    };

    let mut datasets: Vec<Dataset> = samples
        .iter()
        .map(|points| {
            Dataset::default()
                .marker(symbols::Marker::Braille)
                .graph_type(GraphType::Line)
                .style(Style::default().fg(Color::DarkGray))
                .data(points)
        })
        .collect();

    datasets.push(
        Dataset::default()
            .name("Initial")
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::White))
            .data(&baseline),
    );
    datasets.push(
        Dataset::default()
            .name("P97.5")
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::Green))
            .data(&upper),
    );
    datasets.push(
        Dataset::default()
            .name("Median")
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::Yellow))
            .data(&median),
    );
    datasets.push(
        Dataset::default()
            .name("P2.5")
            .marker(symbols::Marker::Braille)
            .graph_type(GraphType::Line)
            .style(Style::default().fg(Color::Red))
            .data(&lower),
    );

    let (min_value, max_value) = lower
        .iter()
        .chain(upper.iter())
        .chain(samples.iter().flatten())
        .map(|(_, v)| *v)
        .filter(|v| v.is_finite())
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), v| (lo.min(v), hi.max(v)));
    let pad = ((max_value - min_value) * 0.05).max(1e-6);

    let chart = Chart::new(datasets)
        .block(
            Block::default()
                .title(Span::styled(
                    format!(" Portfolio Value - {} days, {} paths ", report.horizon_days, report.num_simulations),
                    Style::default().fg(Color::Cyan).add_modifier(Modifier::BOLD),
                ))
                .borders(Borders::ALL),
        )
        .x_axis(
            Axis::default()
                .title("Days")
                .style(Style::default().fg(Color::Gray))
                .bounds([0.0, report.horizon_days as f64])
                .labels(vec![
                    Span::styled("0", Style::default().fg(Color::Gray)),
                    Span::styled(format!("{}", report.horizon_days), Style::default().fg(Color::Gray)),
                ]),
        )
        .y_axis(
            Axis::default()
                .title("Value")
                .style(Style::default().fg(Color::Gray))
                .bounds([min_value - pad, max_value + pad])
                .labels(vec![
                    Span::styled(format!("{:.1}", min_value), Style::default().fg(Color::Gray)),
                    Span::styled(format!("{:.1}", max_value), Style::default().fg(Color::Gray)),
                ]),
        );

    f.render_widget(chart, area);
}

fn render_histogram(f: &mut Frame, app: &App, area: Rect) {
    let labels: Vec<String> = app.histogram.iter().map(|b| format!("{:.0}", (b.lower + b.upper) / 2.0)).collect();
    let data: Vec<(&str, u64)> = labels
        .iter()
        .zip(app.histogram.iter())
        .map(|(label, bin)| (label.as_str(), bin.count as u64))
        .collect();

    let chart = BarChart::default()
        .block(Block::default().title(" Terminal Value Distribution ").borders(Borders::ALL))
        .data(data.as_slice())
        .bar_width(5)
        .bar_gap(1)
        .bar_style(Style::default().fg(Color::Cyan))
        .value_style(Style::default().fg(Color::Black).bg(Color::Cyan));

    f.render_widget(chart, area);
}

fn render_details(f: &mut Frame, app: &App, area: Rect) {
    let report = &app.outcome.report;
    let heading = |text: &'static str| {
        Line::from(Span::styled(text, Style::default().fg(Color::Yellow).add_modifier(Modifier::BOLD)))
    };

    let mut lines = vec![heading("Allocation (weight / daily vol)")];
    let volatilities = app.outcome.statistics.volatilities();
    for ((symbol, w), vol) in app
        .outcome
        .statistics
        .symbols()
        .iter()
        .zip(app.outcome.weights.as_slice())
        .zip(volatilities)
    {
        lines.push(Line::from(format!("{:<8} {:>6.2}%  {:>5.2}%", symbol, w * 100.0, vol * 100.0)));
    }
    lines.push(Line::from(""));

    lines.push(heading("Terminal Value"));
    lines.push(Line::from(format!("Initial: {:.2}", report.initial_investment)));
    lines.push(Line::from(format!("Mean:    {:.2}", report.mean_terminal)));
    lines.push(Line::from(format!("Median:  {:.2}", report.median_terminal)));
    lines.push(Line::from(Span::styled(
        format!("Best:    {:.2}", report.best_terminal),
        Style::default().fg(Color::Green),
    )));
    lines.push(Line::from(Span::styled(
        format!("Worst:   {:.2}", report.worst_terminal),
        Style::default().fg(Color::Red),
    )));
    lines.push(Line::from(format!("P5:      {:.2}", report.percentile_5)));
    lines.push(Line::from(format!("P95:     {:.2}", report.percentile_95)));
    lines.push(Line::from(""));

    lines.push(heading("Outcome"));
    lines.push(Line::from(format!(
        "Favorable: {}/{} ({:.1}%)",
        report.favorable_count, report.num_simulations, report.favorable_rate
    )));
    lines.push(Line::from(format!("Exp. return: {:+.2}%", report.expected_return_pct)));
    lines.push(Line::from(Span::styled(
        format!("Recommendation: {}", report.recommendation),
        Style::default()
            .fg(recommendation_color(report.recommendation))
            .add_modifier(Modifier::BOLD),
    )));

    if !app.assets.is_empty() {
        lines.push(Line::from(""));
        lines.push(heading("Assets (mean / std)"));
        for a in &app.assets {
            lines.push(Line::from(format!("{:<8} {:.2} / {:.2}", a.symbol, a.mean_price, a.std_price)));
        }
    }

    let details = Paragraph::new(lines)
        .block(Block::default().borders(Borders::ALL).title("Details"))
        .style(Style::default().fg(Color::White));

    f.render_widget(details, area);
}
