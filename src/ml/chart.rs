use ab_glyph::{FontRef, PxScale};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, NaiveDateTime, Utc};
use image::{imageops, DynamicImage, ImageFormat, Rgb, RgbImage};
use imageproc::drawing::{
    draw_filled_circle_mut, draw_hollow_rect_mut, draw_line_segment_mut, draw_polygon_mut,
    draw_text_mut, text_size,
};
use imageproc::point::Point;
use imageproc::rect::Rect;
use std::io::Cursor;

use super::forecaster::{ForecastPoint, Observation};
use crate::error::{GatewayError, GatewayResult};

const BACKGROUND: Rgb<u8> = Rgb([255, 255, 255]);
const GRID: Rgb<u8> = Rgb([225, 225, 225]);
const AXIS: Rgb<u8> = Rgb([40, 40, 40]);
const FORECAST: Rgb<u8> = Rgb([0, 114, 178]);
// FORECAST at 20% opacity over white
const BAND: Rgb<u8> = Rgb([204, 227, 240]);
const HISTORY: Rgb<u8> = Rgb([0, 0, 0]);

const MARGIN_LEFT: f32 = 84.0;
const MARGIN_RIGHT: f32 = 20.0;
const MARGIN_TOP: f32 = 36.0;
const MARGIN_BOTTOM: f32 = 52.0;

const GRID_LINES: u32 = 4;

const TITLE: &str = "Hourly Energy Demand Forecast";
const X_LABEL: &str = "Date";
const Y_LABEL: &str = "Energy Demand";
const TICK_FORMAT: &str = "%Y-%m-%d %H:%M";

// DejaVu Sans, Bitstream Vera license (assets/fonts/DejaVuSans-LICENSE)
static FONT_DATA: &[u8] = include_bytes!("../../assets/fonts/DejaVuSans.ttf");

/// Maps data coordinates onto the plotting area.
struct Frame {
    x_min: f64,
    x_span: f64,
    y_min: f64,
    y_span: f64,
    width: f32,
    height: f32,
}

impl Frame {
    fn fit(points: &[ForecastPoint], history: &[Observation], width: u32, height: u32) -> Self {
        let times = points
            .iter()
            .map(|p| seconds(&p.time))
            .chain(history.iter().map(|o| seconds(&o.ds)));
        let (x_min, x_max) = extent(times);

        let values = points
            .iter()
            .flat_map(|p| [p.lower_bound, p.upper_bound])
            .chain(history.iter().map(|o| o.y));
        let (y_min, y_max) = extent(values);
        let pad = ((y_max - y_min) * 0.05).max(1e-9);

        Self {
            x_min,
            x_span: (x_max - x_min).max(1.0),
            y_min: y_min - pad,
            y_span: (y_max - y_min) + 2.0 * pad,
            width: width as f32,
            height: height as f32,
        }
    }

    fn plot_width(&self) -> f32 {
        self.width - MARGIN_LEFT - MARGIN_RIGHT
    }

    fn plot_height(&self) -> f32 {
        self.height - MARGIN_TOP - MARGIN_BOTTOM
    }

    /// Value at the `i`-th horizontal grid line, counted from the top.
    fn grid_value(&self, i: u32) -> f64 {
        self.y_min + self.y_span * (1.0 - i as f64 / GRID_LINES as f64)
    }

    fn x_bounds(&self) -> (String, String) {
        let label = |secs: f64| {
            DateTime::<Utc>::from_timestamp(secs.round() as i64, 0)
                .map(|dt| dt.naive_utc().format(TICK_FORMAT).to_string())
                .unwrap_or_default()
        };
        (label(self.x_min), label(self.x_min + self.x_span))
    }

    fn project(&self, time: &NaiveDateTime, value: f64) -> (f32, f32) {
        let fx = ((seconds(time) - self.x_min) / self.x_span) as f32;
        let fy = ((value - self.y_min) / self.y_span) as f32;
        (
            MARGIN_LEFT + fx * self.plot_width(),
            MARGIN_TOP + (1.0 - fy) * self.plot_height(),
        )
    }
}

fn seconds(time: &NaiveDateTime) -> f64 {
    time.and_utc().timestamp() as f64
}

fn extent(values: impl Iterator<Item = f64>) -> (f64, f64) {
    values
        .filter(|v| v.is_finite())
        .fold(None, |acc: Option<(f64, f64)>, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        })
        .unwrap_or((0.0, 1.0))
}

fn tick_label(value: f64) -> String {
    if value.abs() >= 100.0 {
        format!("{:.0}", value)
    } else {
        format!("{:.2}", value)
    }
}

fn draw_text_at(
    canvas: &mut RgbImage,
    font: &FontRef<'_>,
    scale: PxScale,
    (x, y): (f32, f32),
    anchor: Anchor,
    text: &str,
) {
    let (w, h) = text_size(scale, font, text);
    let left = match anchor {
        Anchor::Left => x,
        Anchor::Center => x - w as f32 / 2.0,
        Anchor::Right => x - w as f32,
    };
    let top = y - h as f32 / 2.0;
    draw_text_mut(canvas, AXIS, left.round() as i32, top.round() as i32, scale, font, text);
}

/// Draws `text` rotated a quarter turn counter-clockwise, centred on `center`.
fn draw_vertical_text(
    canvas: &mut RgbImage,
    font: &FontRef<'_>,
    scale: PxScale,
    center: (f32, f32),
    text: &str,
) {
    let (w, h) = text_size(scale, font, text);
    let mut label = RgbImage::from_pixel(w.max(1), h.max(1) + 4, BACKGROUND);
    draw_text_mut(&mut label, AXIS, 0, 0, scale, font, text);

    let rotated = imageops::rotate270(&label);
    let x = center.0 as i64 - rotated.width() as i64 / 2;
    let y = center.1 as i64 - rotated.height() as i64 / 2;
    imageops::overlay(canvas, &rotated, x, y);
}

#[derive(Clone, Copy)]
enum Anchor {
    Left,
    Center,
    Right,
}

fn to_point((x, y): (f32, f32)) -> Point<i32> {
    Point::new(x.round() as i32, y.round() as i32)
}

/// Draws the forecast line over its uncertainty band, with history as dots.
pub fn render_forecast_chart(
    points: &[ForecastPoint],
    history: &[Observation],
    width: u32,
    height: u32,
) -> GatewayResult<Vec<u8>> {
    let min_width = 2 * (MARGIN_LEFT + MARGIN_RIGHT) as u32;
    let min_height = 2 * (MARGIN_TOP + MARGIN_BOTTOM) as u32;
    if width < min_width || height < min_height {
        return Err(GatewayError::InferenceFailure(format!(
            "chart size {}x{} is too small",
            width, height
        )));
    }

    let font = FontRef::try_from_slice(FONT_DATA)
        .map_err(|e| GatewayError::InferenceFailure(format!("failed to load chart font: {}", e)))?;

    let frame = Frame::fit(points, history, width, height);
    let mut canvas = RgbImage::from_pixel(width, height, BACKGROUND);

    for i in 0..=GRID_LINES {
        let y = MARGIN_TOP + frame.plot_height() * i as f32 / GRID_LINES as f32;
        draw_line_segment_mut(
            &mut canvas,
            (MARGIN_LEFT, y),
            (MARGIN_LEFT + frame.plot_width(), y),
            GRID,
        );
    }

    let mut band: Vec<Point<i32>> = points
        .iter()
        .map(|p| to_point(frame.project(&p.time, p.upper_bound)))
        .chain(
            points
                .iter()
                .rev()
                .map(|p| to_point(frame.project(&p.time, p.lower_bound))),
        )
        .collect();
    band.dedup();
    if band.len() > 2 && band.first() == band.last() {
        band.pop();
    }
    if band.len() > 2 {
        draw_polygon_mut(&mut canvas, &band, BAND);
    }

    for obs in history {
        let dot = to_point(frame.project(&obs.ds, obs.y));
        draw_filled_circle_mut(&mut canvas, (dot.x, dot.y), 2, HISTORY);
    }

    for pair in points.windows(2) {
        draw_line_segment_mut(
            &mut canvas,
            frame.project(&pair[0].time, pair[0].prediction),
            frame.project(&pair[1].time, pair[1].prediction),
            FORECAST,
        );
    }
    if let [only] = points {
        let dot = to_point(frame.project(&only.time, only.prediction));
        draw_filled_circle_mut(&mut canvas, (dot.x, dot.y), 3, FORECAST);
    }

    draw_hollow_rect_mut(
        &mut canvas,
        Rect::at(MARGIN_LEFT as i32, MARGIN_TOP as i32)
            .of_size(frame.plot_width() as u32, frame.plot_height() as u32),
        AXIS,
    );

    draw_labels(&mut canvas, &font, &frame);

    let mut png = Cursor::new(Vec::new());
    DynamicImage::ImageRgb8(canvas)
        .write_to(&mut png, ImageFormat::Png)
        .map_err(|e| GatewayError::InferenceFailure(format!("failed to encode chart: {}", e)))?;

    Ok(png.into_inner())
}

fn draw_labels(canvas: &mut RgbImage, font: &FontRef<'_>, frame: &Frame) {
    let title = PxScale::from(18.0);
    let label = PxScale::from(14.0);
    let tick = PxScale::from(11.0);
    let plot_right = MARGIN_LEFT + frame.plot_width();
    let plot_bottom = MARGIN_TOP + frame.plot_height();

    draw_text_at(
        canvas,
        font,
        title,
        (MARGIN_LEFT + frame.plot_width() / 2.0, MARGIN_TOP / 2.0),
        Anchor::Center,
        TITLE,
    );

    for i in 0..=GRID_LINES {
        let y = MARGIN_TOP + frame.plot_height() * i as f32 / GRID_LINES as f32;
        let text = tick_label(frame.grid_value(i));
        draw_text_at(canvas, font, tick, (MARGIN_LEFT - 6.0, y), Anchor::Right, &text);
    }

    let (first, last) = frame.x_bounds();
    draw_text_at(canvas, font, tick, (MARGIN_LEFT, plot_bottom + 10.0), Anchor::Left, &first);
    draw_text_at(canvas, font, tick, (plot_right, plot_bottom + 10.0), Anchor::Right, &last);

    draw_text_at(
        canvas,
        font,
        label,
        (MARGIN_LEFT + frame.plot_width() / 2.0, plot_bottom + 32.0),
        Anchor::Center,
        X_LABEL,
    );
    draw_vertical_text(
        canvas,
        font,
        label,
        (12.0, MARGIN_TOP + frame.plot_height() / 2.0),
        Y_LABEL,
    );
}

pub fn png_data_url(png: &[u8]) -> String {
    format!("data:image/png;base64,{}", STANDARD.encode(png))
}
