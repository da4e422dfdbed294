/// Produces YUYV frame content. `fill` must write exactly
/// `width * height * 2` bytes and be deterministic in its arguments.
pub trait FrameProducer: Send + Sync {
    fn fill(&self, width: u32, height: u32, frame_index: u64, out: &mut [u8]);
}

const SQUARE: u32 = 64;

// YUYV macropixels: two luma samples sharing one chroma pair
const WHITE: [u8; 4] = [0xeb, 0x80, 0xeb, 0x80];
const GRAY: [u8; 4] = [0x7f, 0x7f, 0x7f, 0x80];

/// Moving checkerboard test pattern: 64-pixel squares drifting one
/// pixel per frame so a frozen pipeline is visible at a glance.
pub struct Checkerboard;

impl FrameProducer for Checkerboard {
    fn fill(&self, width: u32, height: u32, frame_index: u64, out: &mut [u8]) {
        let shift = (frame_index % width as u64) as u32;
        let mut pos = 0usize;
        for y in 0..height {
            let row_parity = (y / SQUARE) & 1;
            for x in (0..width).step_by(2) {
                let shifted_x = (x + shift) % width;
                let cell = if row_parity == (shifted_x / SQUARE) & 1 { &WHITE } else { &GRAY };
                out[pos..pos + 4].copy_from_slice(cell);
                pos += 4;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(width: u32, height: u32, index: u64) -> Vec<u8> {
        let mut out = vec![0u8; (width * height * 2) as usize];
        Checkerboard.fill(width, height, index, &mut out);
        out
    }

    #[test]
    fn writes_exactly_frame_size() {
        let mut out = vec![0xffu8; 128 * 64 * 2 + 8];
        Checkerboard.fill(128, 64, 0, &mut out);
        // the trailing slack is untouched
        assert_eq!(&out[128 * 64 * 2..], &[0xff; 8]);
        // and the frame itself was written
        assert_ne!(&out[0..4], &[0xff; 4]);
    }

    #[test]
    fn deterministic_per_frame_index() {
        assert_eq!(frame(128, 64, 5), frame(128, 64, 5));
        // the drift wraps at the frame width
        assert_eq!(frame(128, 64, 5), frame(128, 64, 5 + 128));
    }

    // a one-pixel drift is invisible at macropixel granularity, so
    // compare frames two apart
    #[test]
    fn pattern_moves_between_frames() {
        assert_ne!(frame(256, 128, 0), frame(256, 128, 2));
        assert_ne!(frame(256, 128, 0), frame(256, 128, 64));
    }

    #[test]
    fn squares_alternate() {
        let f = frame(256, 128, 0);
        // top-left square is white, the square to its right is gray
        assert_eq!(&f[0..4], &WHITE);
        let x = SQUARE as usize; // first pixel of the second square
        assert_eq!(&f[x * 2..x * 2 + 4], &GRAY);
        // one square down flips parity
        let row = 256 * 2;
        assert_eq!(&f[SQUARE as usize * row..SQUARE as usize * row + 4], &GRAY);
    }
}
