//! Pixel layout helpers shared by the decoders and the preview path

use bytes::Bytes;

use crate::pipeline::types::{PixelFormat, VideoFrame};

/// Extract a plane from padded source to contiguous destination.
///
/// Fast path is a single copy when there is no stride padding.
#[inline]
pub fn extract_plane(dst: &mut [u8], src: &[u8], stride: usize, width: usize, height: usize) {
    let total_src = height * stride;

    if stride == width && src.len() >= total_src {
        dst[..width * height].copy_from_slice(&src[..width * height]);
        return;
    }

    for r in 0..height {
        let src_start = r * stride;
        let dst_start = r * width;
        if src_start + width > src.len() || dst_start + width > dst.len() {
            break;
        }
        dst[dst_start..dst_start + width].copy_from_slice(&src[src_start..src_start + width]);
    }
}

#[inline]
fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// Convert packed planar YUV 4:2:0 (BT.601, limited range) into RGB24.
///
/// Returns `None` if `yuv` is shorter than the layout requires.
pub fn yuv420p_to_rgb24(yuv: &[u8], width: usize, height: usize) -> Option<Vec<u8>> {
    let (cw, ch) = (width.div_ceil(2), height.div_ceil(2));
    let y_size = width * height;
    let c_size = cw * ch;
    if yuv.len() < y_size + 2 * c_size {
        return None;
    }

    let (y_plane, rest) = yuv.split_at(y_size);
    let (u_plane, v_plane) = rest.split_at(c_size);

    let mut rgb = Vec::with_capacity(y_size * 3);
    for row in 0..height {
        for col in 0..width {
            let y = y_plane[row * width + col] as i32 - 16;
            let ci = (row / 2) * cw + col / 2;
            let u = u_plane[ci] as i32 - 128;
            let v = v_plane[ci] as i32 - 128;

            let c = 298 * y;
            rgb.push(clamp((c + 409 * v + 128) >> 8));
            rgb.push(clamp((c - 100 * u - 208 * v + 128) >> 8));
            rgb.push(clamp((c + 516 * u + 128) >> 8));
        }
    }
    Some(rgb)
}

/// Make a frame presentable by the preview sink (RGB24)
pub fn to_rgb24(frame: &VideoFrame) -> Option<VideoFrame> {
    match frame.format {
        PixelFormat::Rgb24 => Some(frame.clone()),
        PixelFormat::Yuv420p => {
            let rgb = yuv420p_to_rgb24(&frame.data, frame.width as usize, frame.height as usize)?;
            Some(VideoFrame {
                format: PixelFormat::Rgb24,
                data: Bytes::from(rgb),
                ..frame.clone()
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::types::TimeBase;

    #[test]
    fn test_extract_plane_strips_padding() {
        let src = [1, 2, 0, 0, 3, 4, 0, 0];
        let mut dst = [0u8; 4];
        extract_plane(&mut dst, &src, 4, 2, 2);
        assert_eq!(dst, [1, 2, 3, 4]);

        let mut dst = [0u8; 4];
        extract_plane(&mut dst, &[5, 6, 7, 8], 2, 2, 2);
        assert_eq!(dst, [5, 6, 7, 8]);
    }

    #[test]
    fn test_yuv_grey_and_limits() {
        // 2x2 mid grey: Y=126, neutral chroma
        let grey = yuv420p_to_rgb24(&[126, 126, 126, 126, 128, 128], 2, 2).unwrap();
        assert!(grey.iter().all(|&c| (c as i32 - 128).abs() <= 2));

        let black = yuv420p_to_rgb24(&[16, 16, 16, 16, 128, 128], 2, 2).unwrap();
        assert!(black.iter().all(|&c| c == 0));

        let white = yuv420p_to_rgb24(&[235, 235, 235, 235, 128, 128], 2, 2).unwrap();
        assert!(white.iter().all(|&c| c == 255));
    }

    #[test]
    fn test_short_buffer_rejected() {
        assert!(yuv420p_to_rgb24(&[0; 5], 2, 2).is_none());
    }

    #[test]
    fn test_odd_dimensions() {
        let (w, h) = (3, 3);
        let data = vec![128u8; 9 + 2 * 4];
        assert_eq!(yuv420p_to_rgb24(&data, w, h).unwrap().len(), 27);
    }

    #[test]
    fn test_to_rgb24_converts_yuv() {
        let frame = VideoFrame {
            pts: Some(7),
            time_base: TimeBase::new(1, 90_000),
            width: 2,
            height: 2,
            format: PixelFormat::Yuv420p,
            data: Bytes::from_static(&[16, 16, 16, 16, 128, 128]),
        };
        let rgb = to_rgb24(&frame).unwrap();
        assert_eq!(rgb.format, PixelFormat::Rgb24);
        assert_eq!(rgb.pts, Some(7));
        assert_eq!(rgb.data.len(), 12);
    }
}
