//! Synthetic video source: a white ball orbiting a dark background.
//!
//! Stands in for a camera feed so the full path can run without capture
//! hardware. Frame content changes every frame, which makes dropped or
//! reordered frames visible to a human watching the output.

const BACKGROUND: u8 = 0x10;
const BALL: u8 = 0xeb;

/// Generator for the orbiting-ball pattern.
pub struct BallPattern {
    width: u32,
    height: u32,
    frame_index: u64,
}

impl BallPattern {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            frame_index: 0,
        }
    }

    /// Frames produced so far.
    pub fn frame_index(&self) -> u64 {
        self.frame_index
    }

    /// Render the next frame as a packed 3-byte-per-pixel buffer.
    ///
    /// The ball is monochrome, so the buffer is valid under either channel
    /// ordering.
    pub fn next_frame(&mut self) -> Vec<u8> {
        let w = self.width as f64;
        let h = self.height as f64;
        let radius = (self.height as f64 / 8.0).max(2.0);

        // One full orbit every 60 frames.
        let angle = self.frame_index as f64 * std::f64::consts::TAU / 60.0;
        let cx = w / 2.0 + (w / 2.0 - radius) * 0.8 * angle.cos();
        let cy = h / 2.0 + (h / 2.0 - radius) * 0.8 * angle.sin();

        let mut data = vec![BACKGROUND; self.width as usize * self.height as usize * 3];
        let r2 = radius * radius;

        let y_min = ((cy - radius).floor().max(0.0)) as u32;
        let y_max = ((cy + radius).ceil().min(h - 1.0)) as u32;
        let x_min = ((cx - radius).floor().max(0.0)) as u32;
        let x_max = ((cx + radius).ceil().min(w - 1.0)) as u32;

        for y in y_min..=y_max {
            for x in x_min..=x_max {
                let dx = x as f64 + 0.5 - cx;
                let dy = y as f64 + 0.5 - cy;
                if dx * dx + dy * dy <= r2 {
                    let offset = (y * self.width + x) as usize * 3;
                    data[offset..offset + 3].fill(BALL);
                }
            }
        }

        self.frame_index += 1;
        data
    }
}
