use crate::engine::protocol::PROTOCOL_NAME;
use crate::model::PhaseKind;
use ratatui::{
    layout::Rect,
    style::Color,
    style::Style,
    text::{Line, Span},
    widgets::{Block, Borders, Paragraph},
    Frame,
};

fn key(k: &'static str, desc: &'static str) -> Line<'static> {
    Line::from(vec![
        Span::raw("  "),
        Span::styled(k, Style::default().fg(Color::Magenta)),
        Span::raw(desc),
    ])
}

pub fn draw_help(area: Rect, f: &mut Frame) {
    let mut lines = vec![
        Line::from("Keybinds:"),
        Line::from(vec![
            Span::raw("  "),
            Span::styled("q", Style::default().fg(Color::Magenta)),
            Span::raw(" / "),
            Span::styled("Ctrl-C", Style::default().fg(Color::Magenta)),
            Span::raw("  Quit (abandons a running protocol)"),
        ]),
        key("r", "           Run the protocol (asks for confirmation)"),
        key("y", "           Confirm start"),
        key("↑/↓", "         Scroll the log"),
        key("End", "         Follow new output"),
        key("tab", "         Switch tabs"),
        key("?", "           Show this help"),
        Line::from(""),
        Line::from(format!("{PROTOCOL_NAME} phases:")),
    ];
    for (i, kind) in PhaseKind::ALL.iter().enumerate() {
        lines.push(Line::from(format!("  {}. {}", i + 1, kind.label())));
    }
    lines.push(Line::from(""));
    lines.push(Line::from(
        "Phases cannot be interrupted. Run as Administrator for the restore point and scans.",
    ));

    let p = Paragraph::new(lines).block(Block::default().borders(Borders::ALL).title("Help"));
    f.render_widget(p, area);
}
