//! Listener and context-level mixing parameters

use sf_core::{DistanceModel, Mat4, Vec4, SPEED_OF_SOUND_METERS_PER_SEC};

/// Control-thread snapshot of the listener
#[derive(Debug, Clone)]
pub struct ListenerProps {
    pub position: [f32; 3],
    pub velocity: [f32; 3],
    /// Facing direction
    pub orient_at: [f32; 3],
    /// Up direction; orthonormalized against `orient_at`
    pub orient_up: [f32; 3],
    pub gain: f32,
}

impl Default for ListenerProps {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            velocity: [0.0; 3],
            orient_at: [0.0, 0.0, -1.0],
            orient_up: [0.0, 1.0, 0.0],
            gain: 1.0,
        }
    }
}

/// Context-wide properties published alongside the listener
#[derive(Debug, Clone)]
pub struct ContextProps {
    pub meters_per_unit: f32,
    pub doppler_factor: f32,
    pub doppler_velocity: f32,
    pub speed_of_sound: f32,
    /// When set, each source's own distance model applies
    pub source_distance_model: bool,
    pub distance_model: DistanceModel,
}

impl Default for ContextProps {
    fn default() -> Self {
        Self {
            meters_per_unit: 1.0,
            doppler_factor: 1.0,
            doppler_velocity: 1.0,
            speed_of_sound: SPEED_OF_SOUND_METERS_PER_SEC,
            source_distance_model: false,
            distance_model: DistanceModel::default(),
        }
    }
}

/// Mixer-side derived listener state, rebuilt when props arrive
#[derive(Debug, Clone)]
pub struct ListenerParams {
    /// World-to-listener transform
    pub matrix: Mat4,
    /// Listener velocity in listener space
    pub velocity: Vec4,
    pub gain: f32,
    pub meters_per_unit: f32,
    pub doppler_factor: f32,
    pub speed_of_sound: f32,
    pub reverb_speed_of_sound: f32,
    pub source_distance_model: bool,
    pub distance_model: DistanceModel,
}

impl Default for ListenerParams {
    fn default() -> Self {
        Self {
            matrix: Mat4::IDENTITY,
            velocity: Vec4::ZERO,
            gain: 1.0,
            meters_per_unit: 1.0,
            doppler_factor: 1.0,
            speed_of_sound: SPEED_OF_SOUND_METERS_PER_SEC,
            reverb_speed_of_sound: SPEED_OF_SOUND_METERS_PER_SEC,
            source_distance_model: false,
            distance_model: DistanceModel::default(),
        }
    }
}

impl ListenerParams {
    /// Apply context props (speed of sound, doppler, distance model).
    /// `reverb_ignores_sos` suppresses scaling the reverb speed of sound
    /// by meters-per-unit.
    pub fn apply_context(&mut self, props: &ContextProps, reverb_ignores_sos: bool) {
        self.meters_per_unit = props.meters_per_unit;
        self.doppler_factor = props.doppler_factor;
        self.speed_of_sound = props.speed_of_sound * props.doppler_velocity;
        if !reverb_ignores_sos {
            self.reverb_speed_of_sound = self.speed_of_sound * self.meters_per_unit;
        } else {
            self.reverb_speed_of_sound = self.speed_of_sound;
        }
        self.source_distance_model = props.source_distance_model;
        self.distance_model = props.distance_model;
    }

    /// Rebuild the transform from listener props
    pub fn apply_listener(&mut self, props: &ListenerProps) {
        // AT then UP.
        let mut n = Vec4::direction(props.orient_at[0], props.orient_at[1], props.orient_at[2]);
        n.normalize3();
        let mut v = Vec4::direction(props.orient_up[0], props.orient_up[1], props.orient_up[2]);
        v.normalize3();
        // Build and normalize the right vector.
        let mut u = n.cross3(v);
        u.normalize3();

        self.matrix = Mat4::from_rows([
            [u.x, v.x, -n.x, 0.0],
            [u.y, v.y, -n.y, 0.0],
            [u.z, v.z, -n.z, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ]);

        let p = self
            .matrix
            .transform(Vec4::point(props.position[0], props.position[1], props.position[2]));
        self.matrix.set_row(3, -p.x, -p.y, -p.z, 1.0);

        let vel = Vec4::direction(props.velocity[0], props.velocity[1], props.velocity[2]);
        self.velocity = self.matrix.transform(vel);

        self.gain = props.gain;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_orientation_is_identity_rotation() {
        let mut params = ListenerParams::default();
        params.apply_listener(&ListenerProps::default());

        // Facing -z with +y up: world coordinates pass through.
        let p = params.matrix.transform(Vec4::point(1.0, 2.0, -3.0));
        assert!((p.x - 1.0).abs() < 1e-6);
        assert!((p.y - 2.0).abs() < 1e-6);
        assert!((p.z - -3.0).abs() < 1e-6);
    }

    #[test]
    fn listener_position_translates_sources() {
        let mut params = ListenerParams::default();
        params.apply_listener(&ListenerProps {
            position: [0.0, 0.0, -5.0],
            ..Default::default()
        });

        // A source at the listener position lands at the origin.
        let p = params.matrix.transform(Vec4::point(0.0, 0.0, -5.0));
        assert!(p.x.abs() < 1e-6 && p.y.abs() < 1e-6 && p.z.abs() < 1e-6);
    }

    #[test]
    fn facing_positive_x_rotates_sources() {
        let mut params = ListenerParams::default();
        params.apply_listener(&ListenerProps {
            orient_at: [1.0, 0.0, 0.0],
            orient_up: [0.0, 1.0, 0.0],
            ..Default::default()
        });

        // A source ahead of the listener (at +x) maps to -z (front).
        let p = params.matrix.transform(Vec4::point(1.0, 0.0, 0.0));
        assert!(p.x.abs() < 1e-6);
        assert!((p.z - -1.0).abs() < 1e-6);
    }

    #[test]
    fn reverb_sos_scaling_honors_override() {
        let mut params = ListenerParams::default();
        let props = ContextProps {
            meters_per_unit: 2.0,
            ..Default::default()
        };
        params.apply_context(&props, false);
        assert!((params.reverb_speed_of_sound - params.speed_of_sound * 2.0).abs() < 1e-3);

        params.apply_context(&props, true);
        assert!((params.reverb_speed_of_sound - params.speed_of_sound).abs() < 1e-3);
    }
}
