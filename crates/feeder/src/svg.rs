//! SVG loading: parse a file into one big Bezier path, fit it onto the
//! plotting area, and flatten it into the polylines the planner eats.

use std::path::Path;

use ebb_geom::Point;
use kurbo::{Affine, BezPath, Rect, Shape};
use usvg::{tiny_skia_path::PathSegment, NodeExt, TreeParsing};

/// Margin kept around the drawing when fitting it to the page, mm.
const FIT_MARGIN: f64 = 10.0;

/// Flattening tolerance, mm. Anything tighter than half a motor step is
/// invisible in the output.
pub const FLATTEN_TOLERANCE: f64 = 0.1;

pub fn load_svg(path: &Path) -> anyhow::Result<BezPath> {
    let data = std::fs::read(path)?;
    let opt = usvg::Options::default();
    let tree = usvg::Tree::from_data(&data, &opt)?;
    let mut ret = BezPath::new();

    let cvt = |pt: usvg::tiny_skia_path::Point| kurbo::Point::new(pt.x as f64, pt.y as f64);

    for node in tree.root.descendants() {
        let mut bez = BezPath::new();
        if let usvg::NodeKind::Path(p) = &*node.borrow() {
            let transform = node.abs_transform();
            for seg in p.data.segments() {
                match seg {
                    PathSegment::MoveTo(mut pt) => {
                        transform.map_point(&mut pt);
                        bez.move_to(cvt(pt));
                    }
                    PathSegment::LineTo(mut pt) => {
                        transform.map_point(&mut pt);
                        bez.line_to(cvt(pt));
                    }
                    PathSegment::QuadTo(mut pt1, mut pt2) => {
                        transform.map_point(&mut pt1);
                        transform.map_point(&mut pt2);
                        bez.quad_to(cvt(pt1), cvt(pt2));
                    }
                    PathSegment::CubicTo(mut pt1, mut pt2, mut pt3) => {
                        transform.map_point(&mut pt1);
                        transform.map_point(&mut pt2);
                        transform.map_point(&mut pt3);
                        bez.curve_to(cvt(pt1), cvt(pt2), cvt(pt3));
                    }
                    PathSegment::Close => bez.close_path(),
                }
            }
        }
        ret.extend(bez);
    }
    Ok(ret)
}

/// Scale and center the drawing onto a `width` x `height` page, keeping
/// the aspect ratio and a small margin.
pub fn fit_to_page(path: &mut BezPath, width: f64, height: f64) {
    let bbox = path.bounding_box();
    if bbox.width() <= 0.0 || bbox.height() <= 0.0 {
        return;
    }

    let target = Rect::new(FIT_MARGIN, FIT_MARGIN, width - FIT_MARGIN, height - FIT_MARGIN);
    let scale = (target.height() / bbox.height()).min(target.width() / bbox.width());

    let transform = Affine::translate(-bbox.center().to_vec2())
        .then_scale(scale)
        .then_translate(target.center().to_vec2());

    path.apply_affine(transform);
}

/// Flatten into polylines, one per subpath.
pub fn polylines(path: &BezPath, tolerance: f64) -> Vec<Vec<Point>> {
    let mut ret: Vec<Vec<Point>> = Vec::new();
    let mut current: Vec<Point> = Vec::new();
    path.flatten(tolerance, |el| match el {
        kurbo::PathEl::MoveTo(pt) => {
            if current.len() >= 2 {
                ret.push(std::mem::take(&mut current));
            } else {
                current.clear();
            }
            current.push(Point::new(pt.x, pt.y));
        }
        kurbo::PathEl::LineTo(pt) => current.push(Point::new(pt.x, pt.y)),
        kurbo::PathEl::ClosePath => {
            if let Some(&first) = current.first() {
                current.push(first);
            }
        }
        // flatten() only ever emits the three variants above.
        _ => unreachable!(),
    });
    if current.len() >= 2 {
        ret.push(current);
    }
    ret
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_scales_and_centers() {
        let mut path = BezPath::new();
        path.move_to((0.0, 0.0));
        path.line_to((10.0, 5.0));
        fit_to_page(&mut path, 300.0, 218.0);

        let bbox = path.bounding_box();
        // Fills the page heightwise or widthwise, within the margin.
        let fills_w = (bbox.width() - 280.0).abs() < 1e-6;
        let fills_h = (bbox.height() - 198.0).abs() < 1e-6;
        assert!(fills_w || fills_h);
        assert!((bbox.center().x - 150.0).abs() < 1e-6);
        assert!((bbox.center().y - 109.0).abs() < 1e-6);
    }

    #[test]
    fn polylines_split_on_move_to() {
        let mut path = BezPath::new();
        path.move_to((0.0, 0.0));
        path.line_to((10.0, 0.0));
        path.move_to((20.0, 0.0));
        path.line_to((30.0, 0.0));
        path.close_path();

        let polys = polylines(&path, FLATTEN_TOLERANCE);
        assert_eq!(polys.len(), 2);
        assert_eq!(polys[0].len(), 2);
        // The closed subpath loops back to its start.
        assert_eq!(polys[1].first(), polys[1].last());
    }

    #[test]
    fn curves_flatten_to_many_vertices() {
        let mut path = BezPath::new();
        path.move_to((0.0, 0.0));
        path.curve_to((30.0, 50.0), (70.0, 50.0), (100.0, 0.0));
        let polys = polylines(&path, FLATTEN_TOLERANCE);
        assert_eq!(polys.len(), 1);
        assert!(polys[0].len() > 4);
    }
}
