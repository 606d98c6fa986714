use crate::gpu_structs::{Uniforms, LIGHT_POSITIONS};
use glam::{EulerRot, Mat4, Quat, Vec3};
use std::collections::HashSet;
use winit::event::{ElementState, KeyboardInput, VirtualKeyCode};

const MOVEMENT_SPEED: f32 = 5.0;
const TURN_SPEED: f32 = 1.5;

#[derive(Default)]
pub struct KeyStates {
    down: HashSet<VirtualKeyCode>,
}

impl KeyStates {
    pub fn handle_event(&mut self, input: &KeyboardInput) {
        if let Some(keycode) = input.virtual_keycode {
            match input.state {
                ElementState::Pressed => {
                    self.down.insert(keycode);
                }
                ElementState::Released => {
                    self.down.remove(&keycode);
                }
            }
        }
    }

    fn is_down(&self, keycode: VirtualKeyCode) -> bool {
        self.down.contains(&keycode)
    }
}

pub struct Camera {
    pub position: Vec3,
    // Pitch, yaw and roll in radians.
    pub rotation: Vec3,
}

impl Camera {
    pub fn new(position: Vec3, rotation: Vec3) -> Self {
        Self { position, rotation }
    }

    fn orientation(&self) -> Quat {
        Quat::from_euler(
            EulerRot::YXZ,
            self.rotation.y,
            self.rotation.x,
            self.rotation.z,
        )
    }

    pub fn forward(&self) -> Vec3 {
        self.orientation() * Vec3::new(0.0, 0.0, -1.0)
    }

    fn left(&self) -> Vec3 {
        self.orientation() * Vec3::new(-1.0, 0.0, 0.0)
    }

    fn up(&self) -> Vec3 {
        self.orientation() * Vec3::new(0.0, 1.0, 0.0)
    }

    pub fn update(&mut self, keys: &KeyStates, delta_time: f32) {
        let movement = MOVEMENT_SPEED * delta_time;
        let turn = TURN_SPEED * delta_time;

        if keys.is_down(VirtualKeyCode::W) {
            self.position += self.forward() * movement;
        }
        if keys.is_down(VirtualKeyCode::S) {
            self.position -= self.forward() * movement;
        }
        if keys.is_down(VirtualKeyCode::A) {
            self.position += self.left() * movement;
        }
        if keys.is_down(VirtualKeyCode::D) {
            self.position -= self.left() * movement;
        }
        if keys.is_down(VirtualKeyCode::E) {
            self.position += self.up() * movement;
        }
        if keys.is_down(VirtualKeyCode::Q) {
            self.position -= self.up() * movement;
        }
        if keys.is_down(VirtualKeyCode::Z) {
            self.rotation.y += turn;
        }
        if keys.is_down(VirtualKeyCode::C) {
            self.rotation.y -= turn;
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.forward(), Vec3::Y)
    }

    pub fn projection_matrix(aspect_ratio: f32) -> Mat4 {
        let mut projection = Mat4::perspective_rh(45.0_f32.to_radians(), aspect_ratio, 0.1, 100.0);
        // Vulkan clip space has Y pointing down.
        projection.y_axis.y *= -1.0;
        projection
    }

    pub fn uniforms(&self, aspect_ratio: f32) -> Uniforms {
        Uniforms {
            view_inverse: self.view_matrix().inverse(),
            proj_inverse: Self::projection_matrix(aspect_ratio).inverse(),
            position: self.position.extend(1.0),
            right: (-self.left()).extend(0.0),
            up: self.up().extend(0.0),
            forward: self.forward().extend(0.0),
            light_positions: LIGHT_POSITIONS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_camera() -> Camera {
        Camera::new(Vec3::new(6.3, 4.5, -0.7), Vec3::new(0.0, 1.57, 0.0))
    }

    fn pressed(keycode: VirtualKeyCode) -> KeyStates {
        let mut keys = KeyStates::default();
        keys.down.insert(keycode);
        keys
    }

    #[test]
    fn initial_pose_faces_negative_x() {
        let forward = test_camera().forward();
        assert!((forward.x + 1.0).abs() < 1e-3);
        assert!(forward.y.abs() < 1e-3);
        assert!(forward.z.abs() < 1e-2);
    }

    #[test]
    fn w_key_moves_along_forward() {
        let mut camera = Camera::new(Vec3::ZERO, Vec3::ZERO);
        camera.update(&pressed(VirtualKeyCode::W), 0.5);
        assert!((camera.position - Vec3::new(0.0, 0.0, -2.5)).length() < 1e-5);
    }

    #[test]
    fn yaw_keys_turn_at_a_fixed_rate() {
        let mut camera = Camera::new(Vec3::ZERO, Vec3::ZERO);
        camera.update(&pressed(VirtualKeyCode::Z), 0.1);
        assert!((camera.rotation.y - 0.15).abs() < 1e-6);
        camera.update(&pressed(VirtualKeyCode::C), 0.2);
        assert!((camera.rotation.y + 0.15).abs() < 1e-6);
    }

    #[test]
    fn vertical_keys_ignore_orientation_only_when_level() {
        let mut camera = Camera::new(Vec3::ZERO, Vec3::ZERO);
        camera.update(&pressed(VirtualKeyCode::E), 1.0);
        assert!((camera.position - Vec3::new(0.0, 5.0, 0.0)).length() < 1e-5);
    }

    #[test]
    fn uniforms_pack_points_and_directions() {
        let uniforms = test_camera().uniforms(4.0 / 3.0);
        assert_eq!(uniforms.position.w, 1.0);
        assert_eq!(uniforms.right.w, 0.0);
        assert_eq!(uniforms.up.w, 0.0);
        assert_eq!(uniforms.forward.w, 0.0);
        assert_eq!(uniforms.light_positions, LIGHT_POSITIONS);
    }

    #[test]
    fn right_is_a_unit_vector_orthogonal_to_forward() {
        let uniforms = test_camera().uniforms(4.0 / 3.0);
        let right = uniforms.right.truncate();
        let forward = uniforms.forward.truncate();
        assert!(right.dot(forward).abs() < 1e-5);
        assert!((right.length() - 1.0).abs() < 1e-5);
    }

    #[test]
    fn view_inverse_is_consistent() {
        let camera = test_camera();
        let product = camera.view_matrix() * camera.uniforms(4.0 / 3.0).view_inverse;
        assert!(product.abs_diff_eq(Mat4::IDENTITY, 1e-4));
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        assert!(Camera::projection_matrix(4.0 / 3.0).y_axis.y < 0.0);
    }
}
