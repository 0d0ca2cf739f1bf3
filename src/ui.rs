//! TUI rendering for the UrbanPulse client.
//!
//! All drawing lives here, using `ratatui`. Every loading, error, and empty
//! state gets its own labeled affordance so a failed fetch is never mistaken
//! for fresh data.

use crate::app::{App, ViewMode};
use crate::feed::FeedStatus;
use crate::models::{Category, Incident, Severity};
use crate::stream::StreamState;
use ratatui::{prelude::*, widgets::*};

use ratatui::text::Line;

/// Renders one frame based on current application state.
pub fn render(f: &mut Frame, app: &App) {
    let chunks = Layout::default()
        .direction(Direction::Vertical)
        .constraints([Constraint::Min(0), Constraint::Length(1)])
        .split(f.size());

    match app.view_mode {
        ViewMode::Dashboard => render_dashboard_view(f, app, chunks[0]),
        ViewMode::Feed => render_feed_view(f, app, chunks[0]),
        ViewMode::Settings => render_settings_view(f, app, chunks[0]),
    }

    render_status_bar(f, app, chunks[1]);

    if app.search.active {
        render_search_overlay(f, app);
    }
    if app.report.active {
        render_report_overlay(f, app);
    }
}

fn severity_color(severity: Severity) -> Color {
    match severity {
        Severity::Low => Color::Gray,
        Severity::Medium => Color::Yellow,
        Severity::High => Color::LightRed,
        Severity::Critical => Color::Red,
    }
}

/// Dashboard view: synthesized card list (40%) + detail panel (60%).
fn render_dashboard_view(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(40), Constraint::Percentage(60)])
        .split(area);

    let title = match app.high_priority_count {
        Some(n) if n > 0 => format!(" Dashboard ({n} high priority) "),
        _ => " Dashboard ".to_string(),
    };

    if app.cards.is_empty() {
        let placeholder = match app.stream_state {
            StreamState::Connecting => "Connecting to dashboard stream...",
            StreamState::ReconnectPending => "Stream lost. Reconnecting shortly...",
            StreamState::Disconnected => "Dashboard stream disconnected.",
            StreamState::Connected => "No dashboard cards yet.",
        };
        let msg = Paragraph::new(placeholder)
            .block(Block::default().title(title).borders(Borders::ALL))
            .style(Style::default().fg(Color::DarkGray));
        f.render_widget(msg, chunks[0]);
    } else {
        let items: Vec<ListItem> = app
            .cards
            .iter()
            .enumerate()
            .map(|(i, card)| {
                let style = if i == app.selected_card {
                    Style::default()
                        .fg(Color::Cyan)
                        .bg(Color::Rgb(30, 30, 60))
                        .add_modifier(Modifier::BOLD)
                } else {
                    Style::default()
                };
                ListItem::new(Line::from(vec![
                    Span::styled(
                        format!(" {:<4}", card.priority.label()),
                        Style::default().fg(severity_color(card.priority)),
                    ),
                    Span::styled(format!(" {}", card.title), style),
                ]))
            })
            .collect();

        let list = List::new(items).block(
            Block::default()
                .title(title)
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded),
        );
        f.render_widget(list, chunks[0]);
    }

    // Detail panel for the selected card
    let detail = app
        .cards
        .get(app.selected_card)
        .map(|card| {
            let mut lines = vec![
                Line::from(Span::styled(
                    card.title.clone(),
                    Style::default().add_modifier(Modifier::BOLD),
                )),
                Line::from(""),
                Line::from(card.summary.clone()),
                Line::from(""),
                Line::from(format!("Confidence: {:.0}%", card.confidence * 100.0)),
            ];
            if let Some(d) = card.distance_km {
                lines.push(Line::from(format!("Distance: {d:.1} km")));
            }
            if let Some(action) = &card.suggested_action {
                lines.push(Line::from(""));
                lines.push(Line::from(Span::styled(
                    format!("Suggested: {action}"),
                    Style::default().fg(Color::Green),
                )));
            }
            if let Some(meta) = &card.synthesis {
                lines.push(Line::from(format!(
                    "Synthesized from {} incidents{}",
                    meta.source_count,
                    meta.dominant_topic
                        .as_deref()
                        .map(|t| format!(" (topic: {t})"))
                        .unwrap_or_default()
                )));
                if let Some(insight) = &meta.key_insight {
                    lines.push(Line::from(insight.clone()));
                }
            }
            if let Some(expansion) = &app.card_detail {
                lines.push(Line::from(""));
                lines.push(Line::from(expansion.clone()));
            } else if card.expandable {
                lines.push(Line::from(""));
                lines.push(Line::from(Span::styled(
                    "[Enter] expand for detail",
                    Style::default().fg(Color::DarkGray),
                )));
            }
            lines
        })
        .unwrap_or_else(|| vec![Line::from("Select a card to see detail.")]);

    let panel = Paragraph::new(detail)
        .wrap(Wrap { trim: true })
        .block(
            Block::default()
                .title(" Detail ")
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded),
        );
    f.render_widget(panel, chunks[1]);
}

/// Feed view: incident list (45%) + selected incident detail (55%).
fn render_feed_view(f: &mut Frame, app: &App, area: Rect) {
    let chunks = Layout::default()
        .direction(Direction::Horizontal)
        .constraints([Constraint::Percentage(45), Constraint::Percentage(55)])
        .split(area);

    let filter_label = app
        .active_filter
        .map(|c| format!(" [{}]", c.label()))
        .unwrap_or_default();
    let title = format!(
        " Incidents ({}, {:.0} km){filter_label} ",
        app.feed.total, app.radius_km
    );

    // Loading, error, and empty states each get a distinct affordance.
    if app.feed_loading {
        let msg = Paragraph::new("Loading incidents...")
            .block(Block::default().title(title).borders(Borders::ALL))
            .style(Style::default().fg(Color::Yellow));
        f.render_widget(msg, chunks[0]);
    } else {
        match &app.feed.status {
            FeedStatus::LocationRequired => {
                let msg = Paragraph::new("Waiting for location...")
                    .block(Block::default().title(title).borders(Borders::ALL))
                    .style(Style::default().fg(Color::Yellow));
                f.render_widget(msg, chunks[0]);
            }
            FeedStatus::Error(detail) => {
                let msg = Paragraph::new(format!("Fetch failed: {detail}\n\nPress 'r' to retry."))
                    .wrap(Wrap { trim: true })
                    .block(Block::default().title(" Error ").borders(Borders::ALL))
                    .style(Style::default().fg(Color::Red));
                f.render_widget(msg, chunks[0]);
            }
            FeedStatus::Empty => {
                let msg = Paragraph::new("No incidents found in this area.")
                    .block(Block::default().title(title).borders(Borders::ALL))
                    .style(Style::default().fg(Color::DarkGray));
                f.render_widget(msg, chunks[0]);
            }
            FeedStatus::Ok => {
                let items: Vec<ListItem> = app
                    .feed
                    .incidents
                    .iter()
                    .enumerate()
                    .map(|(i, inc)| incident_row(inc, i == app.selected_index))
                    .collect();
                let list = List::new(items).block(
                    Block::default()
                        .title(title)
                        .borders(Borders::ALL)
                        .border_type(BorderType::Rounded),
                );
                f.render_widget(list, chunks[0]);
            }
        }
    }

    let detail = app
        .feed
        .incidents
        .get(app.selected_index)
        .map(incident_detail)
        .unwrap_or_else(|| vec![Line::from("No incident selected.")]);
    let panel = Paragraph::new(detail)
        .wrap(Wrap { trim: true })
        .block(
            Block::default()
                .title(" Incident ")
                .borders(Borders::ALL)
                .border_type(BorderType::Rounded),
        );
    f.render_widget(panel, chunks[1]);
}

fn incident_row(inc: &Incident, selected: bool) -> ListItem<'static> {
    let style = if selected {
        Style::default()
            .fg(Color::Cyan)
            .bg(Color::Rgb(30, 30, 60))
            .add_modifier(Modifier::BOLD)
    } else {
        Style::default()
    };
    ListItem::new(Line::from(vec![
        Span::styled(
            format!(" {:<4}", inc.severity.label()),
            Style::default().fg(severity_color(inc.severity)),
        ),
        Span::styled(format!(" {:<24}", truncate(&inc.title, 24)), style),
        Span::styled(
            format!(" {:>5.1} km", inc.distance_km),
            Style::default().fg(Color::DarkGray),
        ),
    ]))
}

fn incident_detail(inc: &Incident) -> Vec<Line<'static>> {
    let mut lines = vec![
        Line::from(Span::styled(
            inc.title.clone(),
            Style::default().add_modifier(Modifier::BOLD),
        )),
        Line::from(format!(
            "{} / {}",
            inc.category.label(),
            inc.subcategory.as_deref().unwrap_or("-")
        )),
        Line::from(""),
        Line::from(inc.description.clone()),
        Line::from(""),
        Line::from(format!(
            "Severity: {}   Distance: {:.1} km   Confidence: {:.0}%",
            inc.severity.label(),
            inc.distance_km,
            inc.confidence * 100.0
        )),
        Line::from(format!(
            "Reported: {}",
            inc.created_at.format("%Y-%m-%d %H:%M UTC")
        )),
    ];
    if let Some(pop) = inc.affected_population {
        lines.push(Line::from(format!("Affected population: ~{pop}")));
    }
    lines
}

fn render_settings_view(f: &mut Frame, app: &App, area: Rect) {
    let filters: Vec<String> = Category::ALL
        .iter()
        .enumerate()
        .map(|(i, c)| format!("  [{}] {}", i + 1, c.label()))
        .collect();

    let mut lines = vec![
        Line::from(Span::styled(
            "Settings",
            Style::default().add_modifier(Modifier::BOLD),
        )),
        Line::from(""),
        Line::from(format!("Search radius: {:.0} km  (+/- to change)", app.radius_km)),
        Line::from(format!(
            "Category filter: {}  ([0] clears)",
            app.active_filter.map(|c| c.label()).unwrap_or("All")
        )),
        Line::from(""),
    ];
    lines.extend(filters.into_iter().map(Line::from));
    lines.push(Line::from(""));
    lines.push(Line::from(
        "[r] refresh   [g] re-locate   [/] search   [n] report   [p] demo data   [x] logout   [Tab] view   [q] quit",
    ));

    let panel = Paragraph::new(lines).block(
        Block::default()
            .title(" Settings ")
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded),
    );
    f.render_widget(panel, area);
}

fn render_status_bar(f: &mut Frame, app: &App, area: Rect) {
    let location = match (&app.position, &app.location_error) {
        (_, Some(err)) => Span::styled(
            format!(" location: {err} "),
            Style::default().fg(Color::Red),
        ),
        (Some(pos), None) => Span::styled(
            format!(" {:.4}, {:.4} ", pos.latitude, pos.longitude),
            Style::default().fg(Color::Green),
        ),
        (None, None) => Span::styled(" locating... ", Style::default().fg(Color::Yellow)),
    };

    let stream_color = match app.stream_state {
        StreamState::Connected => Color::Green,
        StreamState::Connecting | StreamState::ReconnectPending => Color::Yellow,
        StreamState::Disconnected => Color::Red,
    };
    let stream = Span::styled(
        format!(" stream: {} ", app.stream_state),
        Style::default().fg(stream_color),
    );

    let advisory = app
        .location_advisory
        .as_deref()
        .map(|msg| Span::styled(format!(" {msg} "), Style::default().fg(Color::Yellow)))
        .unwrap_or_else(|| Span::raw(""));

    let backend = match app.backend_healthy {
        Some(false) => Span::styled(" backend: unreachable ", Style::default().fg(Color::Red)),
        _ => Span::raw(""),
    };

    let notice = app
        .notice
        .as_deref()
        .map(|msg| Span::styled(format!(" {msg} "), Style::default().fg(Color::Cyan)))
        .unwrap_or_else(|| Span::raw(""));

    let updated = app
        .feed
        .last_updated
        .map(|t| format!(" updated {} ", t.format("%H:%M:%S")))
        .unwrap_or_default();

    let bar = Paragraph::new(Line::from(vec![
        location,
        Span::raw("|"),
        stream,
        Span::raw("|"),
        Span::styled(updated, Style::default().fg(Color::DarkGray)),
        backend,
        advisory,
        notice,
    ]));
    f.render_widget(bar, area);
}

fn render_search_overlay(f: &mut Frame, app: &App) {
    let area = centered_rect(50, 3, f.size());
    f.render_widget(Clear, area);
    let input = Paragraph::new(format!("{}_", app.search.buffer)).block(
        Block::default()
            .title(" Search incidents (Enter to run, Esc to cancel) ")
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded),
    );
    f.render_widget(input, area);
}

fn render_report_overlay(f: &mut Frame, app: &App) {
    let area = centered_rect(50, 3, f.size());
    f.render_widget(Clear, area);
    let input = Paragraph::new(format!("{}_", app.report.buffer)).block(
        Block::default()
            .title(" Report incident (Enter to submit, Esc to cancel) ")
            .borders(Borders::ALL)
            .border_type(BorderType::Rounded),
    );
    f.render_widget(input, area);
}

fn centered_rect(percent_x: u16, height: u16, area: Rect) -> Rect {
    // Clamp to the frame: an oversized Rect panics in the render buffer.
    let width = (area.width * percent_x / 100).min(area.width);
    let height = height.min(area.height);
    Rect {
        x: area.x + (area.width.saturating_sub(width)) / 2,
        y: area.y + (area.height.saturating_sub(height)) / 2,
        width,
        height,
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let truncated: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{truncated}…")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fits(inner: Rect, outer: Rect) -> bool {
        inner.x >= outer.x
            && inner.y >= outer.y
            && inner.x + inner.width <= outer.x + outer.width
            && inner.y + inner.height <= outer.y + outer.height
    }

    #[test]
    fn centered_rect_stays_inside_a_short_terminal() {
        let tiny = Rect::new(0, 0, 20, 2);
        let r = centered_rect(50, 3, tiny);
        assert!(fits(r, tiny), "{r:?} escapes {tiny:?}");
    }

    #[test]
    fn centered_rect_centers_in_a_normal_terminal() {
        let area = Rect::new(0, 0, 80, 24);
        let r = centered_rect(50, 3, area);
        assert!(fits(r, area));
        assert_eq!(r.width, 40);
        assert_eq!(r.height, 3);
        assert_eq!(r.x, 20);
    }

    #[test]
    fn truncate_keeps_short_titles_and_marks_long_ones() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a very long incident title", 10), "a very lo…");
    }
}
