//! Per-frame uniform data: the model/view/projection block fed to the
//! vertex shader.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// The uniform block at binding 0 of the vertex stage.
///
/// Column-major `mat4` layout matches GLSL std140 for this struct: three
/// mat4 members, no padding required.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Transforms {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

/// Transform block for a frame `elapsed_secs` after startup, rendering to a
/// target with the given width/height `aspect` ratio.
///
/// The model spins about the Z axis at 90 degrees per second. The camera
/// looks at the origin from (2, 2, 2) with Z up. The projection is a 45
/// degree right-handed perspective with its Y axis flipped, converting
/// GL-convention clip space to Vulkan's downward-Y convention.
pub fn transforms_at(elapsed_secs: f32, aspect: f32) -> Transforms {
    let model =
        Mat4::from_rotation_z(elapsed_secs * std::f32::consts::FRAC_PI_2);
    let view =
        Mat4::look_at_rh(Vec3::new(2.0, 2.0, 2.0), Vec3::ZERO, Vec3::Z);
    let mut proj = Mat4::perspective_rh(
        std::f32::consts::FRAC_PI_4,
        aspect,
        0.1,
        10.0,
    );
    proj.y_axis.y *= -1.0;

    Transforms { model, view, proj }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec4;

    #[test]
    fn model_is_identity_at_time_zero() {
        let t = transforms_at(0.0, 16.0 / 9.0);
        assert!(t.model.abs_diff_eq(Mat4::IDENTITY, 1e-6));
    }

    #[test]
    fn model_rotates_quarter_turn_per_second() {
        let t = transforms_at(1.0, 1.0);
        let rotated = t.model * Vec4::new(1.0, 0.0, 0.0, 1.0);
        assert!((rotated.x - 0.0).abs() < 1e-6);
        assert!((rotated.y - 1.0).abs() < 1e-6);
        assert!((rotated.z - 0.0).abs() < 1e-6);
    }

    #[test]
    fn projection_flips_y() {
        let t = transforms_at(0.0, 1.0);
        assert!(t.proj.y_axis.y < 0.0);

        let unflipped = Mat4::perspective_rh(
            std::f32::consts::FRAC_PI_4,
            1.0,
            0.1,
            10.0,
        );
        assert!((t.proj.y_axis.y + unflipped.y_axis.y).abs() < 1e-6);
    }

    #[test]
    fn wider_aspect_narrows_x_scale() {
        let narrow = transforms_at(0.0, 1.0);
        let wide = transforms_at(0.0, 2.0);
        assert!(
            (wide.proj.x_axis.x - narrow.proj.x_axis.x / 2.0).abs() < 1e-6
        );
    }

    #[test]
    fn view_places_camera_on_diagonal() {
        let t = transforms_at(0.0, 1.0);
        // The camera position maps to the view-space origin.
        let eye = t.view * Vec4::new(2.0, 2.0, 2.0, 1.0);
        assert!(eye.x.abs() < 1e-5);
        assert!(eye.y.abs() < 1e-5);
        assert!(eye.z.abs() < 1e-5);
    }
}
