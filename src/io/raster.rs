use crate::types::{GeoTransform, PixelWindow, TilerError, TilerResult};
use gdal::raster::GdalType;
use gdal::Dataset;
use ndarray::{s, Array2};
use num_traits::{NumCast, Zero};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Pixel data types copied verbatim into tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PixelDataType {
    UInt8,
    UInt16,
    Int16,
    UInt32,
    Int32,
    Float32,
    Float64,
}

impl PixelDataType {
    /// Maps a raw GDAL data type code; complex and 64-bit integer types are not supported
    pub fn from_gdal(code: gdal_sys::GDALDataType::Type) -> Option<Self> {
        use gdal_sys::GDALDataType::*;
        match code {
            GDT_Byte => Some(PixelDataType::UInt8),
            GDT_UInt16 => Some(PixelDataType::UInt16),
            GDT_Int16 => Some(PixelDataType::Int16),
            GDT_UInt32 => Some(PixelDataType::UInt32),
            GDT_Int32 => Some(PixelDataType::Int32),
            GDT_Float32 => Some(PixelDataType::Float32),
            GDT_Float64 => Some(PixelDataType::Float64),
            _ => None,
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            PixelDataType::UInt8 => 1,
            PixelDataType::UInt16 | PixelDataType::Int16 => 2,
            PixelDataType::UInt32 | PixelDataType::Int32 | PixelDataType::Float32 => 4,
            PixelDataType::Float64 => 8,
        }
    }
}

/// Per-band pixel arrays (rows x cols) of one data type
#[derive(Debug, Clone, PartialEq)]
pub enum BandData {
    UInt8(Vec<Array2<u8>>),
    UInt16(Vec<Array2<u16>>),
    Int16(Vec<Array2<i16>>),
    UInt32(Vec<Array2<u32>>),
    Int32(Vec<Array2<i32>>),
    Float32(Vec<Array2<f32>>),
    Float64(Vec<Array2<f64>>),
}

impl BandData {
    pub fn data_type(&self) -> PixelDataType {
        match self {
            BandData::UInt8(_) => PixelDataType::UInt8,
            BandData::UInt16(_) => PixelDataType::UInt16,
            BandData::Int16(_) => PixelDataType::Int16,
            BandData::UInt32(_) => PixelDataType::UInt32,
            BandData::Int32(_) => PixelDataType::Int32,
            BandData::Float32(_) => PixelDataType::Float32,
            BandData::Float64(_) => PixelDataType::Float64,
        }
    }

    pub fn band_count(&self) -> usize {
        match self {
            BandData::UInt8(bands) => bands.len(),
            BandData::UInt16(bands) => bands.len(),
            BandData::Int16(bands) => bands.len(),
            BandData::UInt32(bands) => bands.len(),
            BandData::Int32(bands) => bands.len(),
            BandData::Float32(bands) => bands.len(),
            BandData::Float64(bands) => bands.len(),
        }
    }
}

/// Pixel data of one window, all bands
#[derive(Debug, Clone, PartialEq)]
pub struct PixelBlock {
    pub width: usize,
    pub height: usize,
    pub bands: BandData,
    /// Nodata value per band
    pub no_data: Vec<Option<f64>>,
}

impl PixelBlock {
    pub fn size_bytes(&self) -> usize {
        self.width * self.height * self.bands.band_count() * self.bands.data_type().size_bytes()
    }

    /// Grows the block to `width x height`, keeping the data in the top-left
    /// corner and filling the rest with each band's nodata value, or zero
    pub fn padded(self, width: usize, height: usize) -> PixelBlock {
        if width <= self.width && height <= self.height {
            return self;
        }
        let width = width.max(self.width);
        let height = height.max(self.height);

        let no_data = &self.no_data;
        let bands = match self.bands {
            BandData::UInt8(b) => BandData::UInt8(pad_bands(b, width, height, no_data)),
            BandData::UInt16(b) => BandData::UInt16(pad_bands(b, width, height, no_data)),
            BandData::Int16(b) => BandData::Int16(pad_bands(b, width, height, no_data)),
            BandData::UInt32(b) => BandData::UInt32(pad_bands(b, width, height, no_data)),
            BandData::Int32(b) => BandData::Int32(pad_bands(b, width, height, no_data)),
            BandData::Float32(b) => BandData::Float32(pad_bands(b, width, height, no_data)),
            BandData::Float64(b) => BandData::Float64(pad_bands(b, width, height, no_data)),
        };

        PixelBlock {
            width,
            height,
            bands,
            no_data: self.no_data,
        }
    }
}

fn pad_bands<T>(
    bands: Vec<Array2<T>>,
    width: usize,
    height: usize,
    no_data: &[Option<f64>],
) -> Vec<Array2<T>>
where
    T: Copy + Zero + NumCast,
{
    bands
        .into_iter()
        .enumerate()
        .map(|(index, band)| {
            let fill = no_data
                .get(index)
                .copied()
                .flatten()
                .and_then(|value| <T as NumCast>::from(value))
                .unwrap_or_else(T::zero);
            let (rows, cols) = band.dim();
            let mut padded = Array2::from_elem((height, width), fill);
            padded.slice_mut(s![..rows, ..cols]).assign(&band);
            padded
        })
        .collect()
}

/// Windowed pixel access to a source raster.
///
/// The materializer only ever asks for one tile window at a time through this
/// trait, which keeps tiling memory independent of raster size.
pub trait RasterSource {
    /// `(width, height)` in pixels
    fn dimensions(&self) -> (usize, usize);

    fn band_count(&self) -> usize;

    /// Reads every band of `window` in the source data type
    fn read_window(&self, window: &PixelWindow) -> TilerResult<PixelBlock>;
}

/// Raster to be tiled, as handed over by the upload layer
#[derive(Debug, Clone)]
pub enum RasterInput {
    Path(PathBuf),
    Bytes {
        data: Vec<u8>,
        file_name: Option<String>,
    },
}

impl RasterInput {
    /// Human readable name used in session ids
    pub fn label(&self) -> String {
        let name = match self {
            RasterInput::Path(path) => {
                path.file_stem().map(|stem| stem.to_string_lossy().into_owned())
            }
            RasterInput::Bytes { file_name, .. } => file_name
                .as_deref()
                .map(|name| name.split('.').next().unwrap_or(name).to_string()),
        };
        name.filter(|n| !n.is_empty()).unwrap_or_else(|| "raster".to_string())
    }

    /// Path GDAL can open. Bytes are spooled to a temporary `.tif` file that
    /// lives as long as the returned guard.
    pub fn resolve_path(&self) -> TilerResult<(PathBuf, Option<tempfile::NamedTempFile>)> {
        match self {
            RasterInput::Path(path) => {
                if !path.exists() {
                    return Err(TilerError::Read(format!("Raster not found: {}", path.display())));
                }
                Ok((path.clone(), None))
            }
            RasterInput::Bytes { data, .. } => {
                let mut spool = tempfile::Builder::new()
                    .prefix("rasterlab_upload_")
                    .suffix(".tif")
                    .tempfile()
                    .map_err(|e| {
                        TilerError::Write(format!("Failed to create upload spool file: {}", e))
                    })?;
                spool
                    .write_all(data)
                    .and_then(|_| spool.flush())
                    .map_err(|e| TilerError::Write(format!("Failed to spool upload: {}", e)))?;
                log::debug!("Spooled {} uploaded bytes to {}", data.len(), spool.path().display());
                Ok((spool.path().to_path_buf(), Some(spool)))
            }
        }
    }
}

/// Open GDAL raster with its georeferencing metadata
pub struct RasterHandle {
    dataset: Dataset,
    path: PathBuf,
    width: usize,
    height: usize,
    band_count: usize,
    data_type: PixelDataType,
    geo_transform: Option<GeoTransform>,
    projection_wkt: String,
    no_data: Vec<Option<f64>>,
}

impl RasterHandle {
    /// Opens a raster and reads its metadata; no pixel data is loaded
    pub fn open<P: AsRef<Path>>(path: P) -> TilerResult<Self> {
        let path = path.as_ref();
        log::info!("Opening raster: {}", path.display());

        let dataset = Dataset::open(path)
            .map_err(|e| TilerError::Read(format!("Failed to open {}: {}", path.display(), e)))?;

        let (width, height) = dataset.raster_size();
        let raster_count = dataset.raster_count();
        if raster_count < 1 {
            return Err(TilerError::Read(format!("{} has no raster bands", path.display())));
        }

        let mut no_data = Vec::new();
        let mut band_types = Vec::new();
        for index in 1..=raster_count {
            let band = dataset
                .rasterband(index)
                .map_err(|e| TilerError::Read(format!("Failed to access band {}: {}", index, e)))?;
            no_data.push(band.no_data_value());

            let code = band.band_type() as gdal_sys::GDALDataType::Type;
            band_types.push(PixelDataType::from_gdal(code).ok_or_else(|| {
                TilerError::Read(format!(
                    "Unsupported pixel data type code {} in band {} of {}",
                    code,
                    index,
                    path.display()
                ))
            })?);
        }
        let data_type = uniform_data_type(&band_types).map_err(|e| {
            TilerError::Read(format!("{}: {}", path.display(), e))
        })?;

        // A raster without a geotransform is kept openable; the CRS
        // normalizer reports it as not georeferenced
        let geo_transform = dataset.geo_transform().ok().map(GeoTransform::from_gdal);
        let projection_wkt = dataset.projection();

        log::debug!(
            "Raster {}x{}, {} bands of {:?}, geotransform {:?}",
            width,
            height,
            no_data.len(),
            data_type,
            geo_transform
        );

        Ok(Self {
            dataset,
            path: path.to_path_buf(),
            width,
            height,
            band_count: no_data.len(),
            data_type,
            geo_transform,
            projection_wkt,
            no_data,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn data_type(&self) -> PixelDataType {
        self.data_type
    }

    pub fn geo_transform(&self) -> Option<&GeoTransform> {
        self.geo_transform.as_ref()
    }

    /// Native CRS as WKT; empty when the raster carries none
    pub fn projection_wkt(&self) -> &str {
        &self.projection_wkt
    }

    pub fn no_data(&self) -> &[Option<f64>] {
        &self.no_data
    }

    fn read_bands<T: GdalType + Copy>(&self, window: &PixelWindow) -> TilerResult<Vec<Array2<T>>> {
        let (cols, rows) = (window.width(), window.height());
        let mut bands = Vec::with_capacity(self.band_count);

        for index in 1..=self.dataset.raster_count() {
            let band = self
                .dataset
                .rasterband(index)
                .map_err(|e| TilerError::Read(format!("Failed to access band {}: {}", index, e)))?;
            let buffer = band
                .read_as::<T>(
                    (window.col_start as isize, window.row_start as isize),
                    (cols, rows),
                    (cols, rows),
                    None,
                )
                .map_err(|e| {
                    TilerError::Read(format!(
                        "Failed to read band {} window {:?}: {}",
                        index, window, e
                    ))
                })?;

            let array = Array2::from_shape_vec((rows, cols), buffer.into_shape_and_vec().1)
                .map_err(|e| TilerError::Read(format!("Failed to reshape band {}: {}", index, e)))?;
            bands.push(array);
        }

        Ok(bands)
    }
}

/// Tiles keep the source data type, so every band must share one
fn uniform_data_type(band_types: &[PixelDataType]) -> Result<PixelDataType, String> {
    let first = *band_types.first().ok_or_else(|| "no raster bands".to_string())?;
    match band_types.iter().position(|&t| t != first) {
        Some(index) => Err(format!(
            "mixed band data types ({:?} in band 1, {:?} in band {})",
            first,
            band_types[index],
            index + 1
        )),
        None => Ok(first),
    }
}

impl RasterSource for RasterHandle {
    fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    fn band_count(&self) -> usize {
        self.band_count
    }

    fn read_window(&self, window: &PixelWindow) -> TilerResult<PixelBlock> {
        if !window.fits_within(self.width, self.height) {
            return Err(TilerError::Read(format!(
                "Window {:?} outside {}x{} raster",
                window, self.width, self.height
            )));
        }

        let bands = match self.data_type {
            PixelDataType::UInt8 => BandData::UInt8(self.read_bands(window)?),
            PixelDataType::UInt16 => BandData::UInt16(self.read_bands(window)?),
            PixelDataType::Int16 => BandData::Int16(self.read_bands(window)?),
            PixelDataType::UInt32 => BandData::UInt32(self.read_bands(window)?),
            PixelDataType::Int32 => BandData::Int32(self.read_bands(window)?),
            PixelDataType::Float32 => BandData::Float32(self.read_bands(window)?),
            PixelDataType::Float64 => BandData::Float64(self.read_bands(window)?),
        };

        Ok(PixelBlock {
            width: window.width(),
            height: window.height(),
            bands,
            no_data: self.no_data.clone(),
        })
    }
}
