use crate::{ImageKey, PendingImage, StagedArtifact};
use anyhow::{anyhow, Error};
use async_channel::{Receiver, Sender};
use image::codecs::gif::GifDecoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use percent_encoding::{utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};
use reqwest::header::CONTENT_TYPE;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::*;

/// Bounding box for resized images.
const DEFAULT_BOX: u32 = 300;

/// Larger box for `information` images, which carry legible text.
const INFORMATION_BOX: u32 = 500;

/// Characters escaped in the filename portion of a fetch URL:
/// alphanumerics and `-_.~` stay literal, everything else is encoded.
const FILENAME_ESCAPE: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'~');

/// Process worker: downloads, decodes and resizes one record at a time
/// until the process queue closes. A record that fails at any step is
/// logged and dropped.
pub async fn start(
    cancel_token: CancellationToken,
    process_rx: Receiver<PendingImage>,
    done_tx: Sender<StagedArtifact>,
    tmp_dir: PathBuf,
    http: reqwest::Client,
) {
    loop {
        tokio::select! {
            _ = cancel_token.cancelled() => {
                debug!("Process worker cancelled");
                break;
            },
            record = process_rx.recv() => {
                match record {
                    Err(_) => break,
                    Ok(record) => {
                        if let Err(err) = process(&http, &tmp_dir, &record, &done_tx).await {
                            error!(
                                message = "Error processing image",
                                record_id = record.id,
                                name = %record.name,
                                error = ?err,
                            );
                        }
                    }
                }
            }
        }
    }
    info!("Process worker stopped.");
}

#[instrument(skip(http, tmp_dir, record, done_tx), fields(record_id = %record.id))]
async fn process(
    http: &reqwest::Client,
    tmp_dir: &Path,
    record: &PendingImage,
    done_tx: &Sender<StagedArtifact>,
) -> Result<(), Error> {
    let (local_path, content_type) = download(http, tmp_dir, record).await?;

    let box_size = if record.name.contains("information") {
        INFORMATION_BOX
    } else {
        DEFAULT_BOX
    };
    let staged = local_path.clone();
    tokio::task::spawn_blocking(move || resize_to_fit(&staged, box_size)).await??;

    let key = ImageKey::parse(&record.name)?;
    let artifact = StagedArtifact {
        local_path,
        destination_path: key.object_path(),
        content_type,
        record_id: record.id,
    };

    done_tx
        .send(artifact)
        .await
        .map_err(|_| anyhow!("upload queue closed"))?;

    Ok(())
}

/// Fetch the source image into the staging directory. The response
/// content type's subtype names the staged file's extension.
async fn download(
    http: &reqwest::Client,
    tmp_dir: &Path,
    record: &PendingImage,
) -> Result<(PathBuf, String), Error> {
    let fetch_url = derive_fetch_url(&record.url);
    let response = http.get(&fetch_url).send().await?.error_for_status()?;

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| anyhow!("missing content type for {}", fetch_url))?
        .to_string();
    let extension = content_type
        .split('/')
        .nth(1)
        .ok_or_else(|| anyhow!("malformed content type {:?}", content_type))?
        .to_string();

    let local_path = tmp_dir.join(format!("{}.{}", record.name, extension));
    let bytes = response.bytes().await?;
    tokio::fs::write(&local_path, &bytes).await?;

    Ok((local_path, content_type))
}

/// Rewrite a source URL so the filename portion is percent-encoded while
/// the extension and directory segments stay untouched. Origins that
/// store filenames with spaces or unicode require the encoded form.
pub fn derive_fetch_url(source: &str) -> String {
    let mut segments: Vec<&str> = source.split('/').collect();
    let last = segments.pop().unwrap_or("");
    let prefix = segments.join("/");

    match last.rfind('.') {
        Some(dot) => {
            let (stem, ext) = last.split_at(dot);
            format!(
                "{}/{}{}",
                prefix,
                utf8_percent_encode(stem, FILENAME_ESCAPE),
                ext
            )
        }
        None => format!("{}/{}", prefix, last),
    }
}

/// Decode the staged file, scale it down to fit `box_size` and overwrite
/// it in place. GIFs go through the dedicated decoder, everything else is
/// sniffed by the generic reader. Images already inside the box are kept
/// at their original dimensions.
pub fn resize_to_fit(path: &Path, box_size: u32) -> Result<(), Error> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or("");

    let img: DynamicImage = if extension == "gif" {
        let decoder = GifDecoder::new(BufReader::new(File::open(path)?))?;
        DynamicImage::from_decoder(decoder)?
    } else {
        image::open(path)?
    };

    let (width, height) = img.dimensions();
    let resized = if width > box_size || height > box_size {
        img.resize(box_size, box_size, FilterType::CatmullRom)
    } else {
        img
    };
    resized.save(path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_url_encodes_spaces_in_the_filename() {
        assert_eq!(
            derive_fetch_url("https://cdn.example.com/a/my image.png"),
            "https://cdn.example.com/a/my%20image.png"
        );
    }

    #[test]
    fn fetch_url_without_extension_is_unchanged() {
        assert_eq!(
            derive_fetch_url("https://cdn.example.com/a/noext"),
            "https://cdn.example.com/a/noext"
        );
    }

    #[test]
    fn fetch_url_encodes_up_to_the_final_dot() {
        assert_eq!(
            derive_fetch_url("https://cdn.example.com/a/b.c d.png"),
            "https://cdn.example.com/a/b.c%20d.png"
        );
    }

    #[test]
    fn fetch_url_leaves_directory_segments_alone() {
        assert_eq!(
            derive_fetch_url("https://cdn.example.com/a b/c.png"),
            "https://cdn.example.com/a b/c.png"
        );
    }

    #[test]
    fn resize_shrinks_to_the_bounding_box() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop-1-logo-1.png");
        DynamicImage::new_rgb8(800, 600).save(&path).unwrap();

        resize_to_fit(&path, 300).unwrap();

        let img = image::open(&path).unwrap();
        assert_eq!(img.dimensions(), (300, 225));
    }

    #[test]
    fn resize_preserves_aspect_ratio_for_the_larger_box() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop-1-information-1.png");
        DynamicImage::new_rgb8(1000, 500).save(&path).unwrap();

        resize_to_fit(&path, 500).unwrap();

        let img = image::open(&path).unwrap();
        assert_eq!(img.dimensions(), (500, 250));
    }

    #[test]
    fn resize_never_upscales_small_images() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop-1-logo-2.png");
        DynamicImage::new_rgb8(100, 50).save(&path).unwrap();

        resize_to_fit(&path, 300).unwrap();

        let img = image::open(&path).unwrap();
        assert_eq!(img.dimensions(), (100, 50));
    }

    #[test]
    fn resize_handles_gifs_through_the_dedicated_decoder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("shop-1-logo-3.gif");
        DynamicImage::new_rgb8(400, 400).save(&path).unwrap();

        resize_to_fit(&path, 300).unwrap();

        let img = image::open(&path).unwrap();
        assert_eq!(img.dimensions(), (300, 300));
    }
}
