// Image grids for sample and augmentation previews.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::{Rgb, RgbImage};
use std::path::Path;

/// Resize `(B, C, H, W)` to `(B, C, h, w)`. Integer downscales average
/// whole cells; anything else falls back to nearest neighbour.
pub fn resize_area(images: &Tensor, h: usize, w: usize) -> Result<Tensor> {
    let (_, _, ih, iw) = images.dims4()?;
    if (ih, iw) == (h, w) {
        return Ok(images.clone());
    }
    if ih >= h && iw >= w && ih % h == 0 && iw % w == 0 {
        return images.avg_pool2d((ih / h, iw / w)).map_err(Into::into);
    }
    images.upsample_nearest2d(h, w).map_err(Into::into)
}

/// Tile `(N, 3, H, W)` images in `[0, 1]` into one picture, `nrow` per row,
/// `padding` black pixels between and around tiles.
pub fn make_grid(images: &Tensor, nrow: usize, padding: usize) -> Result<RgbImage> {
    let images = images.to_device(&Device::Cpu)?.to_dtype(DType::F32)?;
    let (n, c, h, w) = images.dims4()?;
    anyhow::ensure!(c == 3, "grid expects RGB images, got {c} channels");
    let cols = nrow.clamp(1, n.max(1));
    let rows = n.div_ceil(cols);
    let cell_h = h + padding;
    let cell_w = w + padding;
    let width = (cols * cell_w + padding) as u32;
    let height = (rows * cell_h + padding) as u32;
    let mut grid = RgbImage::from_pixel(width, height, Rgb([0, 0, 0]));

    let pixels: Vec<f32> = images.clamp(0.0, 1.0)?.flatten_all()?.to_vec1()?;
    let plane = h * w;
    for idx in 0..n {
        let (row, col) = (idx / cols, idx % cols);
        let (oy, ox) = (row * cell_h + padding, col * cell_w + padding);
        let base = idx * 3 * plane;
        for y in 0..h {
            for x in 0..w {
                let at = |ch: usize| (pixels[base + ch * plane + y * w + x] * 255.0).round() as u8;
                grid.put_pixel((ox + x) as u32, (oy + y) as u32, Rgb([at(0), at(1), at(2)]));
            }
        }
    }
    Ok(grid)
}

pub fn save_png(image: &RgbImage, path: &Path) -> Result<()> {
    image
        .save_with_format(path, image::ImageFormat::Png)
        .with_context(|| format!("writing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_grid_dimensions() -> Result<()> {
        let images = Tensor::ones((5, 3, 8, 8), DType::F32, &Device::Cpu)?;
        let grid = make_grid(&images, 2, 2)?;
        // 2 columns, 3 rows
        assert_eq!(grid.dimensions(), (2 * 10 + 2, 3 * 10 + 2));
        assert_eq!(grid.get_pixel(0, 0), &Rgb([0, 0, 0]));
        assert_eq!(grid.get_pixel(2, 2), &Rgb([255, 255, 255]));
        Ok(())
    }

    #[test]
    fn test_resize_area_averages() -> Result<()> {
        let data: Vec<f32> = vec![0.0, 1.0, 1.0, 0.0];
        let img = Tensor::from_vec(data, (1, 1, 2, 2), &Device::Cpu)?;
        let small = resize_area(&img, 1, 1)?;
        assert_eq!(small.flatten_all()?.to_vec1::<f32>()?, vec![0.5]);
        let big = resize_area(&img, 4, 4)?;
        assert_eq!(big.dims(), &[1, 1, 4, 4]);
        Ok(())
    }

    #[test]
    fn test_save_png() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("grid.png");
        let images = Tensor::zeros((2, 3, 4, 4), DType::F32, &Device::Cpu)?;
        save_png(&make_grid(&images, 2, 1)?, &path)?;
        assert!(path.exists());
        Ok(())
    }
}
