//! The JSON plot-file format: a `plot_models` array where each model
//! carries its paths in local coordinates plus a scale and an offset onto
//! the page. Coordinates are millimeters after placement.

use std::path::Path;

use ebb_geom::Point;
use serde::Deserialize;

#[derive(Deserialize)]
struct PlotFile {
    plot_models: Vec<PlotModel>,
}

#[derive(Deserialize)]
struct PlotModel {
    paths: Vec<Vec<[f64; 2]>>,
    #[serde(default = "default_scale")]
    scale: f64,
    #[serde(default)]
    position: [f64; 2],
}

fn default_scale() -> f64 {
    1.0
}

pub fn load_plot(path: &Path) -> anyhow::Result<Vec<Vec<Point>>> {
    let data = std::fs::read(path)?;
    parse(&data)
}

fn parse(data: &[u8]) -> anyhow::Result<Vec<Vec<Point>>> {
    let file: PlotFile = serde_json::from_slice(data)?;
    let mut ret = Vec::new();
    for model in file.plot_models {
        let [ox, oy] = model.position;
        for path in model.paths {
            ret.push(
                path.into_iter()
                    .map(|[x, y]| Point::new(x * model.scale + ox, y * model.scale + oy))
                    .collect(),
            );
        }
    }
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn models_are_scaled_and_placed() {
        let json = br#"{
            "plot_models": [
                {
                    "paths": [[[0, 0], [1, 1]]],
                    "scale": 10.0,
                    "position": [5.0, 7.0]
                },
                {
                    "paths": [[[2, 2], [3, 2]]]
                }
            ]
        }"#;
        let paths = parse(json).unwrap();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[0][0], Point::new(5.0, 7.0));
        assert_eq!(paths[0][1], Point::new(15.0, 17.0));
        // Scale defaults to 1, position to the origin.
        assert_eq!(paths[1][0], Point::new(2.0, 2.0));
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(parse(b"not json").is_err());
        assert!(parse(br#"{"plot_models": [{"paths": "nope"}]}"#).is_err());
    }
}
